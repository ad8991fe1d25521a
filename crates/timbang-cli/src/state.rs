//! Application state shared by the commands.

use std::sync::Arc;

use anyhow::Context;
use timbang_core::{BindingStore, NameFilter, ScaleSession, Scanner, Settings, Transport};

/// Settings plus the session and scanner wired to one transport.
#[derive(Debug, Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

#[derive(Debug)]
struct AppStateInner {
    settings: Settings,
    scanner: Scanner,
    session: ScaleSession,
}

impl AppState {
    /// Open the BlueZ adapter and the binding file named by `settings`.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is unavailable or the binding file is
    /// unreadable.
    #[cfg(feature = "bluetooth")]
    pub async fn new(settings: Settings) -> anyhow::Result<Self> {
        let transport = timbang_core::BluerTransport::new(settings.session.event_buffer)
            .await
            .context("opening Bluetooth adapter")?;
        let store = open_store(&settings)?;
        Ok(Self::with_parts(settings, Arc::new(transport), store))
    }

    /// Always fails: the binary was built without a radio backend.
    ///
    /// # Errors
    ///
    /// Always.
    #[cfg(not(feature = "bluetooth"))]
    #[allow(clippy::unused_async)]
    pub async fn new(_settings: Settings) -> anyhow::Result<Self> {
        anyhow::bail!("timbang was built without the `bluetooth` feature")
    }

    /// Assemble state from an explicit transport and store.
    #[must_use]
    pub fn with_parts(
        settings: Settings,
        transport: Arc<dyn Transport>,
        store: Arc<dyn BindingStore>,
    ) -> Self {
        let filter = NameFilter::new(&settings.scanner.name_tokens);
        let scanner = Scanner::with_filter(Arc::clone(&transport), filter);
        let session = ScaleSession::with_settings(transport, store, settings.session.clone());

        Self {
            inner: Arc::new(AppStateInner {
                settings,
                scanner,
                session,
            }),
        }
    }

    /// Effective settings.
    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    /// Device scanner.
    #[must_use]
    pub fn scanner(&self) -> &Scanner {
        &self.inner.scanner
    }

    /// Connection session.
    #[must_use]
    pub fn session(&self) -> &ScaleSession {
        &self.inner.session
    }
}

#[cfg(feature = "bluetooth")]
fn open_store(settings: &Settings) -> anyhow::Result<Arc<dyn BindingStore>> {
    let path = settings
        .storage
        .resolved_bindings_path()
        .context("no data directory for the binding file; set storage.bindings_path")?;
    let store = timbang_core::JsonFileBindingStore::open(&path)
        .with_context(|| format!("opening binding file {}", path.display()))?;
    Ok(Arc::new(store))
}
