//! Remote method names
//!
//! These are an external wire contract; they are sent verbatim.

pub const AUTH_LOGIN: &str = "auth.login";
pub const AUTH_LOGIN_WITH_API_KEY: &str = "auth.login_with_api_key";

pub const CORE_SUBSCRIBE: &str = "core.subscribe";
pub const CORE_GET_JOBS: &str = "core.get_jobs";

/// Notification method carrying subscribed collection changes
pub const COLLECTION_UPDATE: &str = "collection_update";

pub const SYSTEM_INFO: &str = "system.info";
pub const SYSTEM_GENERAL_UPDATE: &str = "system.general.update";
pub const SYSTEM_GENERAL_UI_RESTART: &str = "system.general.ui_restart";

pub const CERTIFICATE_CHOICES: &str = "app.certificate_choices";
pub const CERTIFICATE_CREATE: &str = "certificate.create";
pub const CERTIFICATE_DELETE: &str = "certificate.delete";

pub const APP_QUERY: &str = "app.query";
pub const APP_CONFIG: &str = "app.config";
pub const APP_UPDATE: &str = "app.update";

pub const FTP_UPDATE: &str = "ftp.update";
