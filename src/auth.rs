use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{PgWireError, PgWireResult};

/// Single front-desk credential shared by every facility.
#[derive(Debug)]
pub struct InnkeepAuthSource {
    user: String,
    password: String,
}

impl InnkeepAuthSource {
    pub fn new(user: String, password: String) -> Self {
        Self { user, password }
    }
}

#[async_trait]
impl AuthSource for InnkeepAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        if login.user().is_some_and(|u| u != self.user) {
            metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
            return Err(PgWireError::InvalidPassword(login.user().unwrap_or_default().to_string()));
        }
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
