//! Password accounts and bearer login tokens.
//!
//! Only the SHA-256 of a login token is stored; the raw token is handed to
//! the client once, at login.

use anyhow::Result;
use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use chrono::Utc;
use sha2::{Digest, Sha256};

use super::ChatRepository;
use crate::models::{AuthToken, User};

/// Hash a password with Argon2id and a random salt.
fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("failed to hash password: {e}"))?;
    Ok(hash.to_string())
}

/// Verify a password against a stored Argon2id hash.
fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let parsed =
        PasswordHash::new(hash).map_err(|e| anyhow::anyhow!("invalid password hash: {e}"))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// SHA-256 of a raw login token, hex encoded.
pub(crate) fn hash_token(token: &str) -> String {
    to_hex(Sha256::digest(token.as_bytes()).as_slice())
}

/// A fresh 256-bit login token, hex encoded.
pub(crate) fn generate_token() -> String {
    to_hex(&rand::random::<[u8; 32]>())
}

impl ChatRepository {
    pub async fn create_user(&self, user: &User) -> Result<()> {
        sqlx::query(
            "INSERT INTO users (id, username, display_name, password_hash, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&user.id)
        .bind(&user.username)
        .bind(&user.display_name)
        .bind(&user.password_hash)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, username, display_name, password_hash, created_at, updated_at
             FROM users WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    pub async fn get_user(&self, user_id: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, username, display_name, password_hash, created_at, updated_at
             FROM users WHERE id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    /// Verify password against stored argon2 hash. Returns the User on success.
    pub async fn verify_user_password(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<User>> {
        let user = match self.get_user_by_username(username).await? {
            Some(u) => u,
            None => return Ok(None),
        };
        if verify_password(password, &user.password_hash)? {
            Ok(Some(user))
        } else {
            Ok(None)
        }
    }

    /// Issue a login token for `user_id`. Returns the raw token.
    pub async fn issue_token(&self, user_id: &str, ttl_secs: i64) -> Result<String> {
        let token = generate_token();
        let now = Utc::now().timestamp();
        sqlx::query(
            "INSERT INTO auth_tokens (token_hash, user_id, created_at, expires_at) VALUES (?, ?, ?, ?)",
        )
        .bind(hash_token(&token))
        .bind(user_id)
        .bind(now)
        .bind(now + ttl_secs)
        .execute(&self.pool)
        .await?;
        Ok(token)
    }

    /// Resolve a raw token to its user. Expired tokens resolve to nothing.
    pub async fn lookup_token(&self, token: &str) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, AuthToken>(
            "SELECT token_hash, user_id, created_at, expires_at FROM auth_tokens WHERE token_hash = ?",
        )
        .bind(hash_token(token))
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(t) if !t.is_expired() => self.get_user(&t.user_id).await,
            _ => Ok(None),
        }
    }

    pub async fn revoke_token(&self, token: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM auth_tokens WHERE token_hash = ?")
            .bind(hash_token(token))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn cleanup_expired_tokens(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM auth_tokens WHERE expires_at <= ?")
            .bind(Utc::now().timestamp())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Hash a password with argon2 for user creation.
    pub fn hash_password(password: &str) -> Result<String> {
        hash_password(password)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::test_helpers;

    async fn repo_with_user(username: &str, password: &str) -> (ChatRepository, User) {
        let repo = test_helpers::test_repository().await;
        let user = User::new(username, username, hash_password(password).unwrap());
        repo.create_user(&user).await.unwrap();
        (repo, user)
    }

    #[test]
    fn test_hash_and_verify_password() {
        let hash = hash_password("hunter2").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("hunter2", &hash).unwrap());
        assert!(!verify_password("wrong", &hash).unwrap());
    }

    #[test]
    fn test_same_password_different_salts() {
        let h1 = hash_password("same").unwrap();
        let h2 = hash_password("same").unwrap();
        assert_ne!(h1, h2);
        assert!(verify_password("same", &h1).unwrap());
        assert!(verify_password("same", &h2).unwrap());
    }

    #[test]
    fn test_token_hash_is_stable_hex() {
        let h = hash_token("abc");
        assert_eq!(h.len(), 64);
        assert_eq!(h, hash_token("abc"));
        assert_ne!(h, hash_token("abd"));
        assert_eq!(
            h,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_generated_tokens_differ() {
        let a = generate_token();
        assert_eq!(a.len(), 64);
        assert_ne!(a, generate_token());
    }

    #[tokio::test]
    async fn test_verify_user_password() {
        let (repo, _) = repo_with_user("bob", "mypass").await;

        assert!(repo.verify_user_password("bob", "mypass").await.unwrap().is_some());
        assert!(repo.verify_user_password("bob", "wrong").await.unwrap().is_none());
        assert!(repo.verify_user_password("nobody", "x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_token_lifecycle() {
        let (repo, user) = repo_with_user("alice", "secret").await;

        let token = repo.issue_token(&user.id, 3600).await.unwrap();
        let found = repo.lookup_token(&token).await.unwrap().unwrap();
        assert_eq!(found.id, user.id);

        assert!(repo.lookup_token("not-a-token").await.unwrap().is_none());

        assert!(repo.revoke_token(&token).await.unwrap());
        assert!(repo.lookup_token(&token).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_tokens_do_not_resolve() {
        let (repo, user) = repo_with_user("carol", "pw").await;

        let token = repo.issue_token(&user.id, -10).await.unwrap();
        assert!(repo.lookup_token(&token).await.unwrap().is_none());
        assert_eq!(repo.cleanup_expired_tokens().await.unwrap(), 1);
    }
}
