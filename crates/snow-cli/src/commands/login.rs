//! Login and logout

use anyhow::Result;
use tracing::info;

use snow_core::InitOutcome;

use super::{connect, Connection};
use crate::output::Output;
use crate::picker::PathPicker;

/// Complete the configured backend's login
pub async fn login(connection: &Connection, output: &Output) -> Result<()> {
    let (_session, backend) = connect(connection, PathPicker::default(), output).await?;
    info!(backend = %backend.name(), "Logged in");

    if output.is_json() {
        println!(
            "{}",
            serde_json::json!({ "status": "ready", "backend": backend.name() })
        );
    } else {
        output.success(&format!("{} backend ready", backend.name()));
    }
    Ok(())
}

/// Forget persisted credentials
pub async fn logout(connection: &Connection, output: &Output) -> Result<()> {
    let session = connection.session(PathPicker::default())?;

    // Without valid credentials the backend stays pending; logout still reaches it
    let outcome = session.start().await?;
    info!(active = matches!(outcome, InitOutcome::Ready), "Logging out");
    session.logout().await?;

    output.success("Logged out");
    Ok(())
}
