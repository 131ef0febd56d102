use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Client id of the Azure CLI public client application. Interactive sign-in
/// reuses it so no app registration is required on the user's side.
pub const DEFAULT_CLIENT_ID: &str = "04b07795-8ddb-461a-bbee-02f9e1bf7b46";

/// Pseudo-tenant accepted by the v2.0 authorize/token endpoints for any work
/// or school account; the issued tokens belong to the account's home tenant.
pub const ORGANIZATIONS_TENANT: &str = "organizations";

const DEFAULT_SUCCESS_TEMPLATE: &str =
    "<html><body><h1>Sign-in complete</h1><p>You may close this window and return to the IDE.</p></body></html>";
const DEFAULT_ERROR_TEMPLATE: &str =
    "<html><body><h1>Sign-in failed</h1><p>Return to the IDE for details.</p></body></html>";

/// National cloud the toolkit talks to. Selects both the identity authority
/// and the management-plane endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AzureEnvironment {
    #[default]
    Public,
    China,
    UsGov,
}

impl AzureEnvironment {
    pub fn authority(&self) -> &'static str {
        match self {
            AzureEnvironment::Public => "https://login.microsoftonline.com",
            AzureEnvironment::China => "https://login.chinacloudapi.cn",
            AzureEnvironment::UsGov => "https://login.microsoftonline.us",
        }
    }

    pub fn management_endpoint(&self) -> &'static str {
        match self {
            AzureEnvironment::Public => "https://management.azure.com",
            AzureEnvironment::China => "https://management.chinacloudapi.cn",
            AzureEnvironment::UsGov => "https://management.usgovcloudapi.net",
        }
    }

    pub fn management_scope(&self) -> String {
        format!("{}/.default", self.management_endpoint())
    }
}

/// Knobs for token acquisition. `Default` matches what the IDE plugins ship
/// with; tests and unusual setups override individual fields.
#[derive(Debug, Clone)]
pub struct AuthOptions {
    pub client_id: String,
    pub client_secret: Option<String>,
    /// Tenant used for sign-in when the caller does not name one.
    pub tenant_id: String,
    pub scopes: Vec<String>,
    /// Port for the loopback redirect listener; 0 binds an ephemeral port.
    pub redirect_port: u16,
    pub prompt: Option<String>,
    pub login_hint: Option<String>,
    pub success_template: String,
    pub error_template: String,
    /// How long the loopback listener waits for the browser to come back.
    pub flow_timeout: Duration,
    /// Tokens expiring within this window count as expired and are refreshed.
    pub expiry_buffer: azure_core::time::Duration,
}

impl AuthOptions {
    pub fn for_environment(environment: AzureEnvironment) -> Self {
        Self {
            client_id: DEFAULT_CLIENT_ID.to_string(),
            client_secret: None,
            tenant_id: ORGANIZATIONS_TENANT.to_string(),
            scopes: vec![
                environment.management_scope(),
                "offline_access".to_string(),
                "openid".to_string(),
                "profile".to_string(),
            ],
            redirect_port: 0,
            prompt: Some("select_account".to_string()),
            login_hint: None,
            success_template: DEFAULT_SUCCESS_TEMPLATE.to_string(),
            error_template: DEFAULT_ERROR_TEMPLATE.to_string(),
            flow_timeout: Duration::from_secs(300),
            expiry_buffer: azure_core::time::Duration::minutes(5),
        }
    }
}

impl Default for AuthOptions {
    fn default() -> Self {
        Self::for_environment(AzureEnvironment::Public)
    }
}

/// Top-level configuration handed to [`crate::Toolkit::new`].
#[derive(Debug, Clone)]
pub struct ToolkitConfig {
    pub environment: AzureEnvironment,
    /// Directory holding the token cache and subscription preferences.
    pub config_dir: PathBuf,
    pub auth: AuthOptions,
}

impl ToolkitConfig {
    pub fn new(config_dir: PathBuf) -> Self {
        let environment = AzureEnvironment::default();
        Self {
            environment,
            config_dir,
            auth: AuthOptions::for_environment(environment),
        }
    }

    pub fn with_environment(mut self, environment: AzureEnvironment) -> Self {
        self.environment = environment;
        self.auth = AuthOptions::for_environment(environment);
        self
    }

    pub fn token_cache_path(&self) -> PathBuf {
        self.config_dir.join("tokenCache.json")
    }

    pub fn subscriptions_path(&self) -> PathBuf {
        self.config_dir.join("subscriptions.json")
    }
}

impl Default for ToolkitConfig {
    fn default() -> Self {
        Self::new(default_config_dir())
    }
}

/// `AZ_TOOLKIT_CONFIG_DIR` wins, then `~/.az-toolkit`, then the working
/// directory as a last resort.
pub fn default_config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("AZ_TOOLKIT_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map(|home| PathBuf::from(home).join(".az-toolkit"))
        .unwrap_or_else(|_| PathBuf::from(".az-toolkit"))
}
