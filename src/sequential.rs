//! Shared foundation for recipes built from ephemeral sequential nodes.
//!
//! Each participant node is named `label-guid-sequence`, where `guid`
//! identifies the recipe instance that created it and `sequence` is the
//! 10-digit, zero-padded decimal counter appended by the service. Ranking
//! siblings by that counter gives every participant the same total order.

use crate::client::{Client, CreateMode, WatchEvent};
use crate::error::{Error, Result};
use log::*;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Width of the sequence suffix appended by the service.
pub const SEQUENCE_WIDTH: usize = 10;

const GUID_WIDTH: usize = 32;

/// Runs `fut` under an optional overall deadline.
pub(crate) async fn bounded<T>(
    timeout: Option<Duration>,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match timeout {
        Some(t) => match tokio::time::timeout(t, fut).await {
            Ok(res) => res,
            Err(_) => Err(Error::Timeout),
        },
        None => fut.await,
    }
}

/// The parsed parts of a participant node name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParticipantName<'a> {
    pub label: &'a str,
    pub guid: &'a str,
    pub sequence: u32,
}

impl<'a> ParticipantName<'a> {
    pub fn parse(name: &'a str) -> Result<ParticipantName<'a>> {
        let malformed = || Error::MalformedName(name.to_string());
        let mut parts = name.rsplitn(3, '-');
        let seq = parts.next().ok_or_else(malformed)?;
        let guid = parts.next().ok_or_else(malformed)?;
        let label = parts.next().ok_or_else(malformed)?;

        if seq.len() != SEQUENCE_WIDTH || !seq.bytes().all(|b| b.is_ascii_digit()) {
            return Err(malformed());
        }

        if guid.len() != GUID_WIDTH || !guid.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(malformed());
        }

        let sequence = seq.parse::<u32>().map_err(|_| malformed())?;
        Ok(ParticipantName {
            label,
            guid,
            sequence,
        })
    }
}

pub struct SequentialRecipe {
    client: Arc<dyn Client>,
    base_path: String,
    guid: String,
    owned_paths: HashMap<String, String>,
}

impl SequentialRecipe {
    pub fn new(client: Arc<dyn Client>, base_path: impl Into<String>) -> SequentialRecipe {
        let mut base_path = base_path.into();
        while base_path.len() > 1 && base_path.ends_with('/') {
            base_path.pop();
        }

        SequentialRecipe {
            client,
            base_path,
            guid: Uuid::new_v4().simple().to_string(),
            owned_paths: HashMap::new(),
        }
    }

    pub fn client(&self) -> &Arc<dyn Client> {
        &self.client
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    pub fn guid(&self) -> &str {
        &self.guid
    }

    /// Full path of the node created for `label`, if any.
    pub fn owned_path(&self, label: &str) -> Option<&str> {
        self.owned_paths.get(label).map(String::as_str)
    }

    pub fn sibling_path(&self, name: &str) -> String {
        if self.base_path == "/" {
            format!("/{name}")
        } else {
            format!("{}/{}", self.base_path, name)
        }
    }

    /// Returns the label portion of a participant node name.
    pub fn determine_znode_label<'a>(&self, name: &'a str) -> Result<&'a str> {
        ParticipantName::parse(name).map(|p| p.label)
    }

    /// Creates every missing component of the base path.
    pub async fn ensure_path(&self) -> Result<()> {
        let mut path = String::new();
        for part in self.base_path.split('/').filter(|p| !p.is_empty()) {
            path.push('/');
            path.push_str(part);
            match self.client.create(&path, &[], CreateMode::Persistent).await {
                Ok(_) | Err(Error::NodeExists(_)) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// Creates a persistent node, treating an existing one as success.
    pub async fn create_znode(&self, path: &str) -> Result<()> {
        match self.client.create(path, &[], CreateMode::Persistent).await {
            Ok(_) | Err(Error::NodeExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Creates this instance's ephemeral sequential node for `label`.
    pub async fn create_unique_znode(&mut self, label: &str) -> Result<String> {
        let path = self.sibling_path(&format!("{}-{}-", label, self.guid));
        let created = match self
            .client
            .create(&path, &[], CreateMode::EphemeralSequential)
            .await
        {
            Err(Error::NoNode(_)) => {
                self.ensure_path().await?;
                self.client
                    .create(&path, &[], CreateMode::EphemeralSequential)
                    .await?
            }
            res => res?,
        };

        debug!("created {created} for label {label}");
        self.owned_paths.insert(label.to_string(), created.clone());
        Ok(created)
    }

    /// Deletes the node created for `label`; an absent node is not an error.
    /// On any other failure the node stays recorded so the delete can be
    /// retried.
    pub async fn delete_unique_znode(&mut self, label: &str) -> Result<()> {
        let Some(path) = self.owned_paths.get(label) else {
            return Ok(());
        };

        match self.client.delete(path).await {
            Ok(()) => {}
            Err(e) if e.is_no_node() => debug!("{path} already gone"),
            Err(e) => return Err(e),
        }

        self.owned_paths.remove(label);
        Ok(())
    }

    /// Stops tracking the node for `label` without deleting it, handing its
    /// lifetime to the caller.
    pub fn disown(&mut self, label: &str) -> Option<String> {
        self.owned_paths.remove(label)
    }

    /// Lists participants ordered by sequence and locates our own nodes.
    ///
    /// Returns the rank of each label this instance currently owns, and the
    /// full list of participant names. Children that are not participant
    /// nodes are left out.
    pub async fn analyze_siblings(&self) -> Result<(HashMap<String, usize>, Vec<String>)> {
        let children = self.client.get_children(&self.base_path).await?;
        let mut ranked: Vec<(u32, String)> = children
            .into_iter()
            .filter_map(|name| match ParticipantName::parse(&name) {
                Ok(p) => Some((p.sequence, name)),
                Err(_) => {
                    trace!("skipping non-participant {name}");
                    None
                }
            })
            .collect();

        ranked.sort_by_key(|(seq, _)| *seq);
        let contenders: Vec<String> = ranked.into_iter().map(|(_, name)| name).collect();

        let mut owned_positions = HashMap::new();
        for (label, path) in &self.owned_paths {
            let name = path.rsplit('/').next().unwrap_or(path);
            if let Some(pos) = contenders.iter().position(|c| c == name) {
                owned_positions.insert(label.clone(), pos);
            }
        }

        Ok((owned_positions, contenders))
    }

    /// Waits until the sibling `name` is deleted.
    pub async fn wait_on_sibling(&self, name: &str) -> Result<()> {
        debug!("waiting on sibling {name}");
        let path = self.sibling_path(name);
        let unblocked = self.client.wait_for_events(&[WatchEvent::Deleted], &path);
        if !self.client.exists(&path, true).await? {
            return Ok(());
        }

        unblocked.await.map(|_| ())
    }
}
