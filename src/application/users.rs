use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::domain::{normalize_email, User, UserId};
use crate::storage::UserRepository;

use super::{bounded, AppError};

/// Registers users and serves their profiles.
pub struct UserService {
    repo: Arc<dyn UserRepository>,
    store_timeout: Duration,
}

impl UserService {
    pub fn new(repo: Arc<dyn UserRepository>, store_timeout: Duration) -> Self {
        Self {
            repo,
            store_timeout,
        }
    }

    /// Register a new user. Emails must be unique.
    pub async fn create_user(&self, name: &str, email: &str) -> Result<User, AppError> {
        let name = name.trim();
        let email = normalize_email(email);

        if name.is_empty() {
            return Err(AppError::InvalidInput("name must not be empty".to_string()));
        }
        if !email.contains('@') {
            return Err(AppError::InvalidInput(format!("invalid email: {}", email)));
        }

        if bounded(self.store_timeout, self.repo.get_user_by_email(&email))
            .await?
            .is_some()
        {
            return Err(AppError::UserAlreadyExists(email));
        }

        let user = User::new(name, email);
        bounded(self.store_timeout, self.repo.save_user(&user)).await?;

        info!(user_id = %user.id, "user created");
        Ok(user)
    }

    /// Get a user's profile.
    pub async fn get_user(&self, user_id: UserId) -> Result<User, AppError> {
        bounded(self.store_timeout, self.repo.get_user(user_id))
            .await?
            .ok_or(AppError::UserNotFound(user_id))
    }
}
