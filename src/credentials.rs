use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use std::{fmt, io::IsTerminal, sync::Arc};
use tokio::sync::OnceCell;

use crate::{error::MdlError, protocol::Protocol};

/// Keyring service under which FASP passwords are stored.
pub const KEYRING_TARGET: &str = "mdl-fasp";
/// Environment variable `ascp` itself reads its password from.
pub const FASP_PASSWORD_ENV: &str = "ASPERA_SCP_PASS";
/// Environment variable holding an OAuth access token for Google Cloud Storage.
pub const GS_TOKEN_ENV: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";

#[derive(Clone)]
pub struct Credentials {
    username: String,
    password: Option<SecretString>,
}

impl PartialEq for Credentials {
    fn eq(&self, other: &Self) -> bool {
        self.username == other.username
            && self.password.as_ref().map(|x| x.expose_secret())
                == other.password.as_ref().map(|x| x.expose_secret())
    }
}

impl Eq for Credentials {}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

impl Credentials {
    pub fn new(username: &str, password: Option<&str>) -> Credentials {
        Credentials {
            username: username.to_string(),
            password: password.map(SecretString::from),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_ref().map(|p| p.expose_secret())
    }

    /// Does nothing if credentials contain no password
    pub async fn save_to_keyring(&self, target: &str) -> Result<(), keyring::Error> {
        let Some(password) = &self.password else {
            return Ok(());
        };
        let username = self.username.clone();
        let password = password.expose_secret().to_owned();
        let target = target.to_owned();

        tokio::task::spawn_blocking(move || {
            let entry = keyring::Entry::new_with_target(&target, "mdl", &username)?;
            entry.set_password(&password)
        })
        .await
        .map_err(|e| keyring::Error::PlatformFailure(Box::new(std::io::Error::other(e))))?
    }

    /// If no entry exists, password will be None
    pub async fn load_from_keyring(username: &str, target: &str) -> Result<Self, keyring::Error> {
        let username = username.to_owned();
        let target = target.to_owned();
        let username_for_keyring = username.clone();

        let password = match tokio::task::spawn_blocking(move || {
            let entry = keyring::Entry::new_with_target(&target, "mdl", &username_for_keyring)?;
            entry.get_password()
        })
        .await
        .map_err(|e| keyring::Error::PlatformFailure(Box::new(std::io::Error::other(e))))?
        {
            Ok(pw) => Some(SecretString::from(pw)),
            Err(keyring::Error::NoEntry) => None,
            Err(e) => return Err(e),
        };

        Ok(Credentials { username, password })
    }
}

/// Supplies secrets for the protocols that need them.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Username and (optional) password for the high-speed transfer servers.
    async fn fasp_credentials(&self) -> Result<Credentials, MdlError>;
    /// Bearer token for cloud blob storage.
    async fn gs_access_token(&self) -> Result<SecretString, MdlError>;
}

/// Asks whoever runs the tool for a password.
pub trait PasswordPrompt: Send + Sync {
    fn ask(&self, username: &str) -> Option<String>;
}

/// Hidden-input prompt on the terminal. Gives up when stdin is not one.
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalPrompt;

impl PasswordPrompt for TerminalPrompt {
    fn ask(&self, username: &str) -> Option<String> {
        if !std::io::stdin().is_terminal() {
            return None;
        }
        match dialoguer::Password::new()
            .with_prompt(format!("FASP password for {}", username))
            .interact()
        {
            Ok(password) => Some(password),
            Err(e) => {
                tracing::warn!("Could not read password: {}", e);
                None
            }
        }
    }
}

/// Reads secrets from the environment, falling back to the OS keyring and
/// then an optional prompt for the FASP password. FASP credentials are
/// resolved once and reused for every transfer.
#[derive(Clone, Default)]
pub struct EnvCredentialProvider {
    fasp_user: Option<String>,
    prompt: Option<Arc<dyn PasswordPrompt>>,
    fasp: Arc<OnceCell<Credentials>>,
}

impl EnvCredentialProvider {
    pub fn new(fasp_user: Option<String>) -> Self {
        Self {
            fasp_user,
            ..Self::default()
        }
    }

    pub fn with_password_prompt(mut self, prompt: Arc<dyn PasswordPrompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    async fn resolve_fasp(&self, user: &str) -> Result<Credentials, MdlError> {
        if let Ok(password) = std::env::var(FASP_PASSWORD_ENV) {
            return Ok(Credentials::new(user, Some(&password)));
        }
        let stored = match Credentials::load_from_keyring(user, KEYRING_TARGET).await {
            Ok(credentials) => credentials,
            Err(e) => {
                tracing::warn!("Could not read FASP password from keyring: {}", e);
                Credentials::new(user, None)
            }
        };
        if stored.password().is_some() {
            return Ok(stored);
        }
        let Some(prompt) = self.prompt.clone() else {
            return Ok(stored);
        };
        let username = user.to_string();
        let answer = tokio::task::spawn_blocking(move || prompt.ask(&username))
            .await
            .ok()
            .flatten();
        Ok(Credentials::new(user, answer.as_deref()))
    }
}

#[async_trait]
impl CredentialProvider for EnvCredentialProvider {
    async fn fasp_credentials(&self) -> Result<Credentials, MdlError> {
        let Some(user) = &self.fasp_user else {
            return Err(MdlError::MissingCredentials {
                protocol: Protocol::Fasp,
                message: "a username is required (--user)".to_string(),
            });
        };
        self.fasp
            .get_or_try_init(|| self.resolve_fasp(user))
            .await
            .cloned()
    }

    async fn gs_access_token(&self) -> Result<SecretString, MdlError> {
        match std::env::var(GS_TOKEN_ENV) {
            Ok(token) if !token.trim().is_empty() => Ok(SecretString::from(token.trim().to_string())),
            _ => Err(MdlError::MissingCredentials {
                protocol: Protocol::Gs,
                message: format!("set {} to an OAuth access token", GS_TOKEN_ENV),
            }),
        }
    }
}
