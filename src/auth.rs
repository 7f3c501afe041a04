use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// Single shared password for every login; the user name is not checked.
#[derive(Debug)]
pub struct RideHoldAuthSource {
    password: String,
}

impl RideHoldAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for RideHoldAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        tracing::debug!("password login for user {:?}", login.user());
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
