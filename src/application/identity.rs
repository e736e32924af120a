use std::future::Future;

use anyhow::Context;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::{Duration, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use tracing::{info, warn};

use crate::domain::{Caller, Role, Session, User, UserId, normalize_email};
use crate::storage::Repository;

use super::AppError;

/// Random bytes per session token; hex-encoded this gives 36 characters.
const TOKEN_BYTES: usize = 18;

/// Resolves a credential into the caller it belongs to.
pub trait IdentityProvider {
    fn resolve_caller(&self, token: &str) -> impl Future<Output = Result<Caller, AppError>> + Send;
}

/// Lists and looks up users for staff browsing.
pub trait Directory {
    fn list_customers(&self) -> impl Future<Output = Result<Vec<User>, AppError>> + Send;

    fn get_user(&self, id: UserId) -> impl Future<Output = Result<User, AppError>> + Send;
}

/// User registration, login and session resolution backed by the repository.
pub struct IdentityService {
    repo: Repository,
    session_ttl: Duration,
}

impl IdentityService {
    pub fn new(repo: Repository, session_ttl: Duration) -> Self {
        Self { repo, session_ttl }
    }

    /// Self-service sign-up. Always creates a customer.
    pub async fn register(&self, name: &str, email: &str, password: &str) -> Result<User, AppError> {
        self.create_user(name, email, password, Role::Customer).await
    }

    /// Provision a user with any role (used by operators to add staff).
    pub async fn create_staff(
        &self,
        name: &str,
        email: &str,
        password: &str,
        role: Role,
    ) -> Result<User, AppError> {
        self.create_user(name, email, password, role).await
    }

    async fn create_user(
        &self,
        name: &str,
        email: &str,
        password: &str,
        role: Role,
    ) -> Result<User, AppError> {
        let name = name.trim();
        let email = normalize_email(email);
        if name.is_empty() {
            return Err(AppError::MissingField("name"));
        }
        if email.is_empty() {
            return Err(AppError::MissingField("email"));
        }
        if password.is_empty() {
            return Err(AppError::MissingField("password"));
        }

        if self.repo.get_user_by_email(&email).await?.is_some() {
            return Err(AppError::UserAlreadyExists(email));
        }

        let password_hash = hash_password(password.to_string()).await?;
        let user = User::new(name.to_string(), &email, password_hash, role);

        // A concurrent sign-up may have taken the email since the lookup
        if !self.repo.save_user(&user).await? {
            return Err(AppError::UserAlreadyExists(email));
        }

        info!(user_id = %user.id, role = %user.role, "user registered");
        Ok(user)
    }

    /// Check credentials and open a session.
    pub async fn login(&self, email: &str, password: &str) -> Result<Session, AppError> {
        if email.trim().is_empty() || password.is_empty() {
            return Err(AppError::InvalidCredentials);
        }

        let Some(user) = self.repo.get_user_by_email(&normalize_email(email)).await? else {
            warn!("login attempt for unknown email");
            return Err(AppError::InvalidCredentials);
        };

        if !verify_password(password.to_string(), user.password_hash.clone()).await? {
            warn!(user_id = %user.id, "login attempt with wrong password");
            return Err(AppError::InvalidCredentials);
        }

        // Housekeeping, so expired tokens don't pile up
        self.repo.delete_expired_sessions(Utc::now()).await?;

        let session = Session::new(new_token(), user.id, self.session_ttl);
        self.repo.save_session(&session).await?;

        info!(user_id = %user.id, "session opened");
        Ok(session)
    }

    /// End a session. Returns whether the token was known.
    pub async fn logout(&self, token: &str) -> Result<bool, AppError> {
        Ok(self.repo.delete_session(token).await?)
    }
}

impl IdentityProvider for IdentityService {
    async fn resolve_caller(&self, token: &str) -> Result<Caller, AppError> {
        let Some(session) = self.repo.get_session(token).await? else {
            return Err(AppError::Unauthenticated);
        };

        if session.is_expired(Utc::now()) {
            self.repo.delete_session(token).await?;
            return Err(AppError::Unauthenticated);
        }

        let user = self
            .repo
            .get_user(session.user_id)
            .await?
            .ok_or(AppError::Unauthenticated)?;

        Ok(Caller {
            user_id: user.id,
            role: user.role,
        })
    }
}

impl Directory for IdentityService {
    async fn list_customers(&self) -> Result<Vec<User>, AppError> {
        Ok(self.repo.list_users_by_role(Role::Customer).await?)
    }

    async fn get_user(&self, id: UserId) -> Result<User, AppError> {
        self.repo
            .get_user(id)
            .await?
            .ok_or_else(|| AppError::AccountNotFound(id.to_string()))
    }
}

fn new_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Argon2 is deliberately slow, so it runs on the blocking pool.
async fn hash_password(password: String) -> Result<String, AppError> {
    let hash = tokio::task::spawn_blocking(move || {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|err| anyhow::anyhow!("Failed to hash password: {}", err))
    })
    .await
    .context("Password hashing task failed")??;

    Ok(hash)
}

async fn verify_password(password: String, password_hash: String) -> Result<bool, AppError> {
    let matches = tokio::task::spawn_blocking(move || {
        let parsed = PasswordHash::new(&password_hash)
            .map_err(|err| anyhow::anyhow!("Stored password hash is invalid: {}", err))?;
        Ok::<bool, anyhow::Error>(
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok(),
        )
    })
    .await
    .context("Password verification task failed")??;

    Ok(matches)
}
