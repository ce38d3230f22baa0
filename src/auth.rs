use std::collections::HashMap;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// Cleartext password check: a per-business password when one is
/// configured, the shared password otherwise.
#[derive(Debug, Clone)]
pub struct AppointdAuthSource {
    default_password: String,
    tenant_passwords: HashMap<String, String>,
}

impl AppointdAuthSource {
    pub fn new(default_password: String, tenant_passwords: HashMap<String, String>) -> Self {
        Self {
            default_password,
            tenant_passwords,
        }
    }

    pub fn password_for(&self, tenant: Option<&str>) -> &str {
        tenant
            .and_then(|t| self.tenant_passwords.get(t))
            .unwrap_or(&self.default_password)
    }
}

#[async_trait]
impl AuthSource for AppointdAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let password = self.password_for(login.database());
        Ok(Password::new(None, password.as_bytes().to_vec()))
    }
}
