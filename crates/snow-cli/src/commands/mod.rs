//! Command handlers
//!
//! Every command that talks to a backend goes through [`connect`], which
//! starts the configured backend and drives it through login when needed.

pub mod config;
pub mod entries;
pub mod login;
pub mod media;
pub mod resolve;
pub mod scan;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde_yaml::Value;

use snow_core::{
    Backend, BackendRegistry, CallbackParams, Config, FileStateStore, InitOutcome, LoginForm,
    LoginOutcome, Session,
};

use crate::output::Output;
use crate::picker::PathPicker;

/// What a command needs to reach the configured backend
pub struct Connection {
    pub config: Config,
    /// Return URL of the browser sign-in flow
    pub callback: Option<String>,
    /// Values for the backend's login form
    pub fields: Vec<(String, String)>,
}

impl Connection {
    /// Build a session for the configured backend without starting it
    pub fn session(&self, picker: PathPicker) -> Result<Session> {
        let state_store = FileStateStore::open(self.config.state_path())
            .context("Failed to open local state")?;

        let mut session = Session::new(
            BackendRegistry::with_builtin(),
            Arc::new(picker),
            Arc::new(state_store),
        );
        if let Some(url) = &self.callback {
            let params = CallbackParams::from_url(url)
                .with_context(|| format!("Invalid callback URL: {}", url))?;
            session = session.with_callback(params);
        }

        session.load_config(self.config.clone());
        Ok(session)
    }

    fn login_form(&self) -> LoginForm {
        self.fields.iter().cloned().collect()
    }
}

/// Start the configured backend and return its session once it is active
///
/// A login form without fields is submitted straight away; one with fields
/// is only submitted when `--login-field` values were given.
pub async fn connect(
    connection: &Connection,
    picker: PathPicker,
    output: &Output,
) -> Result<(Session, Arc<dyn Backend>)> {
    let session = connection.session(picker)?;

    match session.start().await? {
        InitOutcome::Ready => {}
        InitOutcome::Redirect(url) => return redirect(&url, output),
        InitOutcome::LoginRequired(form) => {
            if !form.fields.is_empty() && connection.fields.is_empty() {
                output.print_login_config(&form);
                bail!(
                    "{} requires login. Pass the form values with --login-field name=value.",
                    form.title
                );
            }
            match session.submit_login(connection.login_form()).await? {
                LoginOutcome::Ready => {}
                LoginOutcome::Redirect(url) => return redirect(&url, output),
            }
        }
    }

    let backend = session.backend()?;
    Ok((session, backend))
}

fn redirect<T>(url: &str, output: &Output) -> Result<T> {
    output.print_redirect(url);
    if output.should_prompt() {
        if let Err(e) = open::that(url) {
            tracing::warn!(error = %e, "Could not open browser");
        }
    }
    bail!(
        "Sign-in continues in the browser. Run the command again with \
         --callback <URL> using the address the browser returns to."
    )
}

/// Resolve a `--dest` path against the current directory
pub fn dest_path(dest: Option<PathBuf>) -> Result<Option<PathBuf>> {
    dest.map(|path| {
        std::path::absolute(&path).with_context(|| format!("Invalid path: {}", path.display()))
    })
    .transpose()
}

/// Parse a `key=value` argument
pub fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", s))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("missing key in '{}'", s));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Interpret a command-line value as YAML, falling back to a plain string
pub fn field_value(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Null;
    }
    match serde_yaml::from_str::<Value>(raw) {
        Ok(value @ (Value::Bool(_) | Value::Number(_) | Value::Sequence(_))) => value,
        _ => Value::String(raw.to_string()),
    }
}
