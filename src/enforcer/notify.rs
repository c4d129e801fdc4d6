use anyhow::{bail, Context, Result};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::Notifier;

const AGENT_PATH: &str = "/org/guardian/Agent";
const AGENT_INTERFACE: &str = "org.guardian.Agent1";
const AGENT_NAME_PREFIX: &str = "org.guardian.Agent.";

/// Delivers notifications to per-user desktop agents discovered on the
/// session bus by well-known name: `org.guardian.Agent.<username>.<instance>`.
///
/// The bus connection is cached and dropped on failure so the next attempt
/// reconnects. Delivery is fire-and-forget per agent instance.
pub struct AgentNotifier {
    connection: Mutex<Option<zbus::Connection>>,
}

impl AgentNotifier {
    pub fn new() -> Self {
        Self {
            connection: Mutex::new(None),
        }
    }

    async fn connection(&self) -> Result<zbus::Connection> {
        let mut cached = self.connection.lock().await;
        if let Some(conn) = cached.as_ref() {
            return Ok(conn.clone());
        }
        let conn = zbus::Connection::session()
            .await
            .context("failed to connect to session bus")?;
        *cached = Some(conn.clone());
        Ok(conn)
    }

    async fn drop_connection(&self) {
        *self.connection.lock().await = None;
    }

    async fn agent_names(&self, conn: &zbus::Connection, username: &str) -> Result<Vec<String>> {
        let dbus = zbus::fdo::DBusProxy::new(conn)
            .await
            .context("failed to create bus proxy")?;
        let prefix = format!("{AGENT_NAME_PREFIX}{username}.");
        let names = dbus
            .list_names()
            .await
            .context("failed to enumerate bus names")?;
        Ok(names
            .into_iter()
            .map(|n| n.to_string())
            .filter(|n| n.starts_with(&prefix))
            .collect())
    }
}

impl Default for AgentNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier for AgentNotifier {
    async fn notify(&self, username: &str, title: &str, body: &str, urgency: u8) -> Result<()> {
        let conn = match self.connection().await {
            Ok(conn) => conn,
            Err(e) => {
                self.drop_connection().await;
                return Err(e);
            }
        };

        let names = match self.agent_names(&conn, username).await {
            Ok(names) => names,
            Err(e) => {
                self.drop_connection().await;
                return Err(e);
            }
        };
        if names.is_empty() {
            bail!("no notification agent registered for {username}");
        }

        let mut delivered = 0usize;
        for name in &names {
            let proxy = match zbus::Proxy::new(&conn, name.clone(), AGENT_PATH, AGENT_INTERFACE)
                .await
            {
                Ok(proxy) => proxy,
                Err(e) => {
                    warn!(agent = %name, error = %e, "failed to reach agent");
                    continue;
                }
            };
            match proxy
                .call_noreply("Notify", &(title, body, urgency))
                .await
            {
                Ok(()) => {
                    debug!(agent = %name, "notification delivered");
                    delivered += 1;
                }
                Err(e) => {
                    warn!(agent = %name, error = %e, "notification call failed");
                }
            }
        }

        if delivered == 0 {
            bail!("no agent instance of {username} accepted the notification");
        }
        Ok(())
    }
}
