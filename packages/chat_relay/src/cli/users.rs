//! `relay add-user`: create a password account directly in the database.

use anyhow::{Result, bail};

use crate::config::RelayConfig;
use crate::db::Database;
use crate::models::User;
use crate::repository::ChatRepository;

const MIN_PASSWORD_LEN: usize = 8;

fn validate_username(username: &str) -> Result<()> {
    let ok_chars = username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if !(2..=64).contains(&username.len()) || !ok_chars {
        bail!("Username must be 2-64 characters of letters, digits, '-', '_' or '.'");
    }
    Ok(())
}

pub async fn add_user_command(
    config: &RelayConfig,
    username: &str,
    display_name: Option<String>,
    password: Option<String>,
) -> Result<()> {
    validate_username(username)?;

    let db = Database::new(config).await?;
    let repository = ChatRepository::new(db.pool.clone());
    if repository.get_user_by_username(username).await?.is_some() {
        bail!("User '{}' already exists", username);
    }

    let password = match password {
        Some(password) => password,
        None => {
            let password =
                super::prompt_line(&format!("Password for {username} (min {MIN_PASSWORD_LEN} chars): ")).await?;
            let confirm = super::prompt_line("Confirm password: ").await?;
            if confirm != password {
                bail!("Passwords don't match");
            }
            password
        }
    };
    if password.len() < MIN_PASSWORD_LEN {
        bail!("Password too short");
    }

    let display_name = display_name.unwrap_or_else(|| username.to_string());
    let user = User::new(username, &display_name, ChatRepository::hash_password(&password)?);
    repository.create_user(&user).await?;
    eprintln!("User '{}' created.", username);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usernames() {
        assert!(validate_username("alice").is_ok());
        assert!(validate_username("a.b-c_d").is_ok());
        assert!(validate_username("a").is_err());
        assert!(validate_username("has space").is_err());
        assert!(validate_username(&"x".repeat(65)).is_err());
    }
}
