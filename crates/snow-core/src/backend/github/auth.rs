//! OAuth handshake
//!
//! The login action stores a random state token and sends the user to the
//! authorize URL. When the forge redirects back, the callback parameters
//! are checked against the stored token before the code is exchanged.

use tracing::warn;
use url::Url;
use uuid::Uuid;

use crate::error::{BackendError, BackendResult};
use crate::state::StateStore;

/// Key of the pending OAuth state token
pub const STATE_KEY: &str = "SNOW_CMS::GH_AUTH:STATE";

/// Key of the persisted access token
pub const TOKEN_KEY: &str = "SNOW_CMS::GH_AUTH:TOKEN";

const AUTHORIZE_URL: &str = "https://github.com/login/oauth/authorize";

/// Where a GitHub login stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPhase {
    Unauthenticated,
    AwaitingCallback,
    ExchangingCode,
    AuthenticatedNoInstall,
    AwaitingAppInstall,
    Active,
    Invalid,
}

/// Query parameters of the URL the forge redirected back to
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub setup_action: Option<String>,
}

impl CallbackParams {
    /// Read `code`, `state` and `setup_action` from a full URL
    pub fn from_url(url: &str) -> Result<Self, url::ParseError> {
        let url = Url::parse(url)?;
        let mut params = Self::default();
        for (key, value) in url.query_pairs() {
            let value = Some(value.into_owned());
            match key.as_ref() {
                "code" => params.code = value,
                "state" => params.state = value,
                "setup_action" => params.setup_action = value,
                _ => {}
            }
        }
        Ok(params)
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_none() && self.state.is_none() && self.setup_action.is_none()
    }
}

/// What the callback parameters ask the backend to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackAction {
    /// Nothing to handle
    None,
    /// The app was just installed; resume or restart login
    Installed,
    /// Trade the code for an access token
    Exchange { code: String },
}

/// Check callback parameters against the stored state token
///
/// A `state` that does not match the stored token, or a `code` arriving
/// without one, clears the stored token and fails with `AuthState`.
pub fn check_callback(
    params: &CallbackParams,
    store: &dyn StateStore,
) -> BackendResult<CallbackAction> {
    let stored = store.get(STATE_KEY);

    let matched = match (&params.state, &stored) {
        (Some(returned), Some(stored)) => returned == stored,
        (None, _) => params.code.is_none(),
        (Some(_), None) => false,
    };

    if !matched {
        warn!("OAuth state mismatch, clearing stored state");
        if let Err(e) = store.remove(STATE_KEY) {
            warn!(error = %e, "Failed to clear stored OAuth state");
        }
        return Err(BackendError::AuthState);
    }

    if params.setup_action.is_some() {
        return Ok(CallbackAction::Installed);
    }

    Ok(match &params.code {
        Some(code) => CallbackAction::Exchange { code: code.clone() },
        None => CallbackAction::None,
    })
}

/// A fresh random state token
pub fn generate_state() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Forge authorization URL for this client
pub fn authorize_url(client_id: &str, redirect_uri: &str, state: &str) -> BackendResult<String> {
    let url = Url::parse_with_params(
        AUTHORIZE_URL,
        &[
            ("client_id", client_id),
            ("redirect_uri", redirect_uri),
            ("state", state),
        ],
    )
    .map_err(|e| BackendError::Configuration {
        key: "backend.redirect_uri".to_string(),
        details: e.to_string(),
    })?;
    Ok(url.into())
}

/// Page where the user installs the app
pub fn install_url(app_slug: &str) -> String {
    format!("https://github.com/apps/{}/installations/new", app_slug)
}
