use anyhow::Result;
use parking_lot::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("token not found")]
    TokenNotFound,
    #[error("empty token")]
    EmptyToken,
}

/// What the API client needs to know about the signed-in user.
pub trait AuthSession: Send + Sync {
    fn is_authenticated(&self) -> bool;
    fn token(&self) -> Result<String>;
    fn log_out(&self);
}

#[derive(Default)]
pub struct Manager {
    token: RwLock<Option<String>>,
}

impl Manager {
    pub fn new(token: Option<String>) -> Self {
        let token = token
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty());
        Self {
            token: RwLock::new(token),
        }
    }

    pub fn sign_in(&self, token: &str) -> Result<()> {
        let token = token.trim();
        if token.is_empty() {
            return Err(SessionError::EmptyToken.into());
        }
        *self.token.write() = Some(token.to_string());
        Ok(())
    }
}

impl AuthSession for Manager {
    fn is_authenticated(&self) -> bool {
        self.token.read().is_some()
    }

    fn token(&self) -> Result<String> {
        self.token
            .read()
            .clone()
            .ok_or_else(|| SessionError::TokenNotFound.into())
    }

    fn log_out(&self) {
        if self.token.write().take().is_some() {
            tracing::info!("session cleared");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_token_is_not_a_session() {
        let manager = Manager::new(Some("   ".into()));
        assert!(!manager.is_authenticated());
        assert!(manager.token().is_err());
    }

    #[test]
    fn sign_in_then_log_out() {
        let manager = Manager::default();
        manager.sign_in(" abc ").unwrap();
        assert!(manager.is_authenticated());
        assert_eq!(manager.token().unwrap(), "abc");
        manager.log_out();
        assert!(!manager.is_authenticated());
        let err = manager.token().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SessionError>(),
            Some(SessionError::TokenNotFound)
        ));
    }

    #[test]
    fn empty_sign_in_is_rejected() {
        let manager = Manager::new(Some("keep".into()));
        assert!(manager.sign_in("").is_err());
        assert_eq!(manager.token().unwrap(), "keep");
    }
}
