//! File-backed identity and acceptance store.
//!
//! Four regions under `<dirpath>`: the local estate record, one record per
//! remote estate, the local role record, and one acceptance record per
//! remote role. Acceptance keys off the role, so remotes sharing a role
//! share one authorization decision. Every dump is an atomic replace
//! (write temp, fsync, rename), so a crash never leaves a torn record;
//! there is no cross-file guarantee and loaders tolerate partial state.

use std::fs;
use std::io::Write as _;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::estate::{Acceptance, AutoMode};

/// On-disk codec. Affects keep files only, never the wire.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KeepKind {
    Json,
    Msgpack,
}

impl KeepKind {
    pub fn ext(self) -> &'static str {
        match self {
            KeepKind::Json => "json",
            KeepKind::Msgpack => "msgpack",
        }
    }

    fn encode<T: Serialize>(self, record: &T) -> Result<Vec<u8>> {
        match self {
            KeepKind::Json => {
                let mut text = serde_json::to_vec_pretty(record)?;
                text.push(b'\n');
                Ok(text)
            }
            KeepKind::Msgpack => Ok(rmp_serde::to_vec_named(record)?),
        }
    }

    fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T> {
        match self {
            KeepKind::Json => Ok(serde_json::from_slice(bytes)?),
            KeepKind::Msgpack => Ok(rmp_serde::from_slice(bytes)?),
        }
    }
}

/// Persisted local estate. Unknown fields in stored records are ignored.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LocalRecord {
    pub name: String,
    pub uid: u32,
    pub ha: SocketAddr,
    pub aha: SocketAddr,
    pub fqdn: String,
    pub role: String,
    pub sid: u32,
    pub puid: u32,
    pub sighex: String,
    pub prihex: String,
}

/// Persisted remote estate.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub name: String,
    pub uid: u32,
    pub fuid: u32,
    pub ha: SocketAddr,
    pub fqdn: String,
    pub role: String,
    pub sid: u32,
    pub main: bool,
    pub kind: u8,
    pub joined: Option<bool>,
    pub acceptance: Option<Acceptance>,
    pub verhex: String,
    pub pubhex: String,
}

/// Persisted per-role acceptance decision.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoleRecord {
    pub role: String,
    pub acceptance: Option<Acceptance>,
    pub verhex: String,
    pub pubhex: String,
}

/// The keep for one road stack.
#[derive(Debug)]
pub struct RoadKeep {
    dirpath: PathBuf,
    kind: KeepKind,
    /// New-peer acceptance policy; `Once` self-demotes after it fires.
    pub auto: AutoMode,
}

impl RoadKeep {
    /// Opens (creating directories as needed) the keep at `dirpath`. An
    /// unwritable location transparently relocates to `~/.raet/keep/<name>`.
    pub fn new(dirpath: PathBuf, name: &str, kind: KeepKind, auto: AutoMode) -> Result<Self> {
        let dirpath = match ensure_tree(&dirpath) {
            Ok(()) => dirpath,
            Err(err) => {
                let fallback = dirs::home_dir()
                    .ok_or(err)?
                    .join(".raet")
                    .join("keep")
                    .join(name);
                tracing::warn!(
                    "keep dir {} unwritable, falling back to {}",
                    dirpath.display(),
                    fallback.display()
                );
                ensure_tree(&fallback)?;
                fallback
            }
        };
        Ok(RoadKeep {
            dirpath,
            kind,
            auto,
        })
    }

    pub fn dirpath(&self) -> &Path {
        &self.dirpath
    }

    pub fn local_path(&self) -> PathBuf {
        self.dirpath
            .join("local")
            .join(format!("estate.{}", self.kind.ext()))
    }

    pub fn remote_path(&self, name: &str) -> PathBuf {
        self.dirpath
            .join("remote")
            .join(format!("estate.{}.{}", name, self.kind.ext()))
    }

    pub fn local_role_path(&self) -> PathBuf {
        self.dirpath
            .join("role")
            .join("local")
            .join(format!("role.{}", self.kind.ext()))
    }

    pub fn remote_role_path(&self, role: &str) -> PathBuf {
        self.dirpath
            .join("role")
            .join("remote")
            .join(format!("role.{}.{}", role, self.kind.ext()))
    }

    fn dump<T: Serialize>(&self, path: &Path, record: &T) -> Result<()> {
        let bytes = self.kind.encode(record)?;
        let temp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&temp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&temp, path)?;
        Ok(())
    }

    fn load<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(self.kind.decode(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(Error::Keep(err)),
        }
    }

    fn clear(path: &Path) {
        let _ = fs::remove_file(path);
    }

    pub fn dump_local(&self, record: &LocalRecord) -> Result<()> {
        self.dump(&self.local_path(), record)
    }

    pub fn load_local(&self) -> Result<Option<LocalRecord>> {
        self.load(&self.local_path())
    }

    pub fn clear_local(&self) {
        Self::clear(&self.local_path());
    }

    pub fn dump_remote(&self, record: &RemoteRecord) -> Result<()> {
        self.dump(&self.remote_path(&record.name), record)
    }

    pub fn load_all_remotes(&self) -> Result<Vec<RemoteRecord>> {
        let dir = self.dirpath.join("remote");
        let mut records = Vec::new();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(records),
            Err(err) => return Err(Error::Keep(err)),
        };
        for entry in entries {
            let path = entry?.path();
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if !name.starts_with("estate.") || !name.ends_with(self.kind.ext()) {
                continue;
            }
            if let Some(record) = self.load(&path)? {
                records.push(record);
            }
        }
        records.sort_by_key(|record: &RemoteRecord| record.uid);
        Ok(records)
    }

    pub fn clear_remote(&self, name: &str) {
        Self::clear(&self.remote_path(name));
    }

    pub fn clear_all_remotes(&self) {
        if let Ok(entries) = fs::read_dir(self.dirpath.join("remote")) {
            for entry in entries.flatten() {
                let _ = fs::remove_file(entry.path());
            }
        }
    }

    pub fn dump_local_role(&self, record: &RoleRecord) -> Result<()> {
        self.dump(&self.local_role_path(), record)
    }

    pub fn dump_remote_role(&self, record: &RoleRecord) -> Result<()> {
        self.dump(&self.remote_role_path(&record.role), record)
    }

    pub fn load_remote_role(&self, role: &str) -> Result<Option<RoleRecord>> {
        self.load(&self.remote_role_path(role))
    }

    pub fn clear_remote_role(&self, role: &str) {
        Self::clear(&self.remote_role_path(role));
    }

    pub fn clear_all_roles(&self) {
        Self::clear(&self.local_role_path());
        if let Ok(entries) = fs::read_dir(self.dirpath.join("role").join("remote")) {
            for entry in entries.flatten() {
                let _ = fs::remove_file(entry.path());
            }
        }
    }

    /// Removes every record and the keep directory itself.
    pub fn clear_all(&self) {
        let _ = fs::remove_dir_all(&self.dirpath);
    }

    /// Applies the acceptance policy to a presented identity.
    ///
    /// A new role is pended under `auto = never`, accepted otherwise (and
    /// `once` burns its fuse). A known role returns its stored decision when
    /// the keys match; differing keys are rejected unless the stack is
    /// mutable, in which case the stored keys are rewritten in place.
    pub fn status_remote(
        &mut self,
        role: &str,
        verhex: &str,
        pubhex: &str,
        mutable: bool,
    ) -> Result<Acceptance> {
        match self.load_remote_role(role)? {
            None => {
                let acceptance = match self.auto {
                    AutoMode::Never => Acceptance::Pending,
                    AutoMode::Once => {
                        self.auto = AutoMode::Never;
                        Acceptance::Accepted
                    }
                    AutoMode::Always => Acceptance::Accepted,
                };
                self.dump_remote_role(&RoleRecord {
                    role: role.to_owned(),
                    acceptance: Some(acceptance),
                    verhex: verhex.to_owned(),
                    pubhex: pubhex.to_owned(),
                })?;
                Ok(acceptance)
            }
            Some(record) => {
                if record.verhex == verhex && record.pubhex == pubhex {
                    Ok(record.acceptance.unwrap_or(Acceptance::Pending))
                } else if mutable {
                    let acceptance = record.acceptance.unwrap_or(Acceptance::Pending);
                    self.dump_remote_role(&RoleRecord {
                        role: role.to_owned(),
                        acceptance: Some(acceptance),
                        verhex: verhex.to_owned(),
                        pubhex: pubhex.to_owned(),
                    })?;
                    Ok(acceptance)
                } else {
                    Ok(Acceptance::Rejected)
                }
            }
        }
    }
}

fn ensure_tree(dirpath: &Path) -> Result<()> {
    for sub in ["local", "remote", "role/local", "role/remote"] {
        fs::create_dir_all(dirpath.join(sub))?;
    }
    // surface read-only mounts now rather than at the first dump
    let probe = dirpath.join(".probe");
    fs::write(&probe, b"")?;
    fs::remove_file(&probe)?;
    Ok(())
}
