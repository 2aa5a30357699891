use anyhow::Context;
use async_trait::async_trait;
use tokio::process::Command;
use udf_core::{Error, Result};

/// Opens URLs for the user during interactive login.
#[async_trait]
pub trait UserAgent: Send + Sync {
    async fn open(&self, url: &str) -> Result<()>;
}

/// Opens URLs with the platform's default browser launcher.
#[derive(Debug, Clone, Default)]
pub struct SystemBrowser;

impl SystemBrowser {
    fn launcher() -> Option<(&'static str, &'static [&'static str])> {
        if cfg!(target_os = "macos") {
            Some(("open", &[]))
        } else if cfg!(target_os = "windows") {
            Some(("cmd", &["/C", "start", ""]))
        } else if std::env::var_os("DISPLAY").is_some()
            || std::env::var_os("WAYLAND_DISPLAY").is_some()
        {
            Some(("xdg-open", &[]))
        } else {
            None
        }
    }
}

#[async_trait]
impl UserAgent for SystemBrowser {
    async fn open(&self, url: &str) -> Result<()> {
        let Some((program, args)) = Self::launcher() else {
            return Err(Error::bad_credentials(
                "no browser is available to log in; use the two-step login instead",
            ));
        };

        let status = Command::new(program)
            .args(args)
            .arg(url)
            .status()
            .await
            .with_context(|| format!("spawn {program}"))
            .map_err(|e| Error::bad_credentials(format!("could not open a browser: {e:#}")))?;

        if !status.success() {
            return Err(Error::bad_credentials(format!(
                "could not open a browser: {program} exited with {status}"
            )));
        }
        Ok(())
    }
}

/// Never opens anything; for headless environments and tests.
#[derive(Debug, Clone, Default)]
pub struct NoBrowser;

#[async_trait]
impl UserAgent for NoBrowser {
    async fn open(&self, _url: &str) -> Result<()> {
        Err(Error::bad_credentials(
            "no browser is available to log in; use the two-step login instead",
        ))
    }
}
