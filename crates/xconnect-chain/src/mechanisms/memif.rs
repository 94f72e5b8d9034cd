//! Shared-memory packet ring between the forwarder and a local workload.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;

use xconnect_types::{
    Connection, ConnectionRequest, Env, Interface, InterfaceLink, Leg, Mechanism, MechanismClass,
    Result, XconnectError,
};

use super::{dataplane_name, is_establish, MechanismHandler};

pub const MECHANISM: &str = "MEMIF";

/// Socket path, relative to the forwarder's memif base directory.
pub const SOCKET_FILENAME: &str = "socketfile";

pub struct Memif {
    base_dir: PathBuf,
}

impl Memif {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn default_socket(connection_id: &str) -> String {
        format!("{connection_id}/memif.sock")
    }

    /// Resolve a socket parameter under the base directory, refusing paths that escape it.
    fn socket_path(&self, socketfile: &str) -> Result<PathBuf> {
        let relative = Path::new(socketfile);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if socketfile.is_empty() || escapes {
            return Err(XconnectError::InvalidMechanism {
                mechanism: MECHANISM.into(),
                message: format!("socket path '{socketfile}' must be relative to the memif directory"),
            });
        }
        Ok(self.base_dir.join(relative))
    }
}

#[async_trait]
impl MechanismHandler for Memif {
    fn mechanism_type(&self) -> &str {
        MECHANISM
    }

    fn preference(&self, request: &ConnectionRequest) -> Mechanism {
        Mechanism::new(MechanismClass::Local, MECHANISM)
            .with_parameter(SOCKET_FILENAME, Self::default_socket(request.id()))
    }

    fn complete(&self, connection_id: &str, mechanism: &mut Mechanism) -> Result<()> {
        mechanism
            .parameters
            .entry(SOCKET_FILENAME.to_string())
            .or_insert_with(|| Self::default_socket(connection_id));
        Ok(())
    }

    async fn attach(&self, env: &mut Env, leg: Leg, connection: &Connection) -> Result<()> {
        let socketfile = connection
            .mechanism
            .as_ref()
            .and_then(|m| m.parameter(SOCKET_FILENAME))
            .ok_or_else(|| XconnectError::InvalidMechanism {
                mechanism: MECHANISM.into(),
                message: format!("connection '{}' carries no {SOCKET_FILENAME}", connection.id),
            })?;
        let path = self.socket_path(socketfile)?;

        // The forwarder listens on incoming memifs, so it owns the socket directory.
        let master = leg == Leg::Ingress;
        if master && is_establish(env) {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let id = env.config_mut().add_interface(Interface::new(
            dataplane_name(leg, "memif", &connection.id),
            InterfaceLink::Memif {
                socket_filename: path,
                master,
            },
        ));
        env.config_mut().associate(connection.id.clone(), id);
        tracing::debug!(connection = %connection.id, %leg, master, "Staged memif interface");
        Ok(())
    }
}
