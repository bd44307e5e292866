/// Middleware modules for the API server
///
/// - `request_id`: correlation id extension and `x-request-id` header
/// - `admin_auth`: administrator bearer JWT plus live classifier check
/// - `security`: security response headers

pub mod admin_auth;
pub mod request_id;
pub mod security;
