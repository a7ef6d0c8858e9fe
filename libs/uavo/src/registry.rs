use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use flate2::read::GzDecoder;
use indexmap::IndexMap;
use tar::Archive;
use tracing::{debug, info, trace, warn};

use crate::definition::ObjectDefinition;
use crate::error::Error;
use crate::types::ObjectId;

pub const DEFAULT_REMOTE_BASE: &str = "http://dronin-autotown.appspot.com/uavos";
/// Path of the definitions inside a flight software checkout.
pub const DEFINITION_DIR: &str = "shared/uavobjectdefinition/";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const NAME_PREFIX: &str = "UAVO_";

/// Where definitions for a firmware revision can be fetched from.
#[derive(Clone, Debug)]
pub struct RevisionSource {
    /// Checkout to run `git archive` in. `None` skips git.
    pub repo_dir: Option<PathBuf>,
    /// Base URL of the archive service. `None` skips the remote fallback.
    pub remote_base: Option<String>,
}

impl Default for RevisionSource {
    fn default() -> Self {
        RevisionSource {
            repo_dir: Some(PathBuf::from(".")),
            remote_base: Some(DEFAULT_REMOTE_BASE.to_string()),
        }
    }
}

impl RevisionSource {
    pub fn with_repo_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.repo_dir = Some(dir.into());
        self
    }

    pub fn with_remote_base(mut self, base: impl Into<String>) -> Self {
        self.remote_base = Some(base.into());
        self
    }

    pub fn without_git(mut self) -> Self {
        self.repo_dir = None;
        self
    }

    pub fn without_remote(mut self) -> Self {
        self.remote_base = None;
        self
    }

    fn git_archive(&self, rev: &str) -> Option<Vec<u8>> {
        let dir = self.repo_dir.as_ref()?;
        let output = Command::new("git")
            .args(["archive", rev, "--", DEFINITION_DIR])
            .current_dir(dir)
            .output();
        match output {
            Ok(output) if output.status.success() => Some(output.stdout),
            Ok(output) => {
                debug!(rev, stderr = %String::from_utf8_lossy(&output.stderr).trim(), "git archive failed");
                None
            }
            Err(err) => {
                debug!(rev, ?err, "unable to run git");
                None
            }
        }
    }

    #[cfg(feature = "remote")]
    fn download(&self, rev: &str) -> Option<Vec<u8>> {
        let base = self.remote_base.as_ref()?;
        let url = format!("{}/{}", base.trim_end_matches('/'), rev);
        let res = match ureq::get(&url).call() {
            Ok(res) => res,
            Err(err) => {
                debug!(%url, ?err, "definition download failed");
                return None;
            }
        };
        let mut buf = Vec::new();
        match res.into_reader().read_to_end(&mut buf) {
            Ok(_) => Some(buf),
            Err(err) => {
                debug!(%url, ?err, "failed to read response");
                None
            }
        }
    }

    #[cfg(not(feature = "remote"))]
    fn download(&self, rev: &str) -> Option<Vec<u8>> {
        if self.remote_base.is_some() {
            debug!(rev, "built without the `remote` feature, skipping download");
        }
        None
    }
}

/// Immutable set of object definitions keyed by id, in load order.
#[derive(Clone, Debug, Default)]
pub struct SchemaRegistry {
    defs: IndexMap<ObjectId, Arc<ObjectDefinition>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_xml<S: AsRef<str>>(docs: impl IntoIterator<Item = S>) -> Result<Self, Error> {
        let mut registry = SchemaRegistry::new();
        registry.load_xml(docs)?;
        Ok(registry)
    }

    /// Loads every `*.xml` file in `dir`.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self, Error> {
        let mut docs = Vec::new();
        for entry in fs::read_dir(dir.as_ref())? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "xml") && path.is_file() {
                docs.push(fs::read_to_string(&path)?);
            }
        }
        Self::from_xml(docs)
    }

    /// Loads the `.xml` members of a tar archive, gzip compressed or not.
    pub fn from_tar_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let docs = if bytes.starts_with(&GZIP_MAGIC) {
            tar_documents(GzDecoder::new(bytes))?
        } else {
            tar_documents(bytes)?
        };
        Self::from_xml(docs)
    }

    /// Fetches the definitions of the first revision that loads, trying
    /// `git archive` before the remote archive service for each candidate.
    /// Returns the registry along with the revision that produced it.
    pub fn from_revisions<S: AsRef<str>>(
        source: &RevisionSource,
        revisions: &[S],
    ) -> Result<(Self, String), Error> {
        for rev in revisions.iter().map(AsRef::as_ref) {
            let fetchers: [fn(&RevisionSource, &str) -> Option<Vec<u8>>; 2] =
                [RevisionSource::git_archive, RevisionSource::download];
            for archive in fetchers.iter().filter_map(|fetch| fetch(source, rev)) {
                match Self::from_tar_bytes(&archive) {
                    Ok(registry) if !registry.is_empty() => {
                        info!(rev, objects = registry.len(), "loaded object definitions");
                        return Ok((registry, rev.to_string()));
                    }
                    Ok(_) => debug!(rev, "archive contained no definitions"),
                    Err(err) => warn!(rev, %err, "unable to load definition archive"),
                }
            }
        }
        Err(Error::RevisionNotFound(
            revisions.iter().map(|r| r.as_ref().to_string()).collect(),
        ))
    }

    /// Compiles definitions in passes until every document is registered.
    ///
    /// A document that fails is retried on the next pass, so references may
    /// appear in any order. When a pass registers nothing, the first error
    /// that is not a reference error is returned, otherwise
    /// [`Error::Unresolved`] naming every remaining definition.
    pub fn load_xml<S: AsRef<str>>(&mut self, docs: impl IntoIterator<Item = S>) -> Result<usize, Error> {
        let mut pending: Vec<S> = docs.into_iter().collect();
        let mut loaded = 0;
        let mut pass = 0;
        while !pending.is_empty() {
            pass += 1;
            let before = pending.len();
            let mut failed = Vec::new();
            let mut errors = Vec::new();
            for doc in pending {
                match ObjectDefinition::from_xml(doc.as_ref(), self) {
                    Ok(def) => {
                        trace!(name = def.name(), id = %def.id(), pass, "registered definition");
                        self.insert(def);
                        loaded += 1;
                    }
                    Err(err) => {
                        trace!(pass, %err, "deferring definition");
                        errors.push(err);
                        failed.push(doc);
                    }
                }
            }
            if failed.len() == before {
                if let Some(pos) = errors.iter().position(|e| !is_reference_error(e)) {
                    return Err(errors.swap_remove(pos));
                }
                let names = failed.iter().map(|doc| definition_name(doc.as_ref())).collect();
                return Err(Error::Unresolved(names));
            }
            pending = failed;
        }
        debug!(loaded, pass, "definitions resolved");
        Ok(loaded)
    }

    pub fn insert(&mut self, def: ObjectDefinition) -> Arc<ObjectDefinition> {
        let def = Arc::new(def);
        if let Some(old) = self.defs.insert(def.id(), def.clone()) {
            debug!(name = old.name(), id = %old.id(), "replaced definition");
        }
        def
    }

    pub fn get(&self, id: ObjectId) -> Option<&Arc<ObjectDefinition>> {
        self.defs.get(&id)
    }

    /// Lookup by the 8 hex digit registry key.
    pub fn get_by_key(&self, key: &str) -> Option<&Arc<ObjectDefinition>> {
        let id = u32::from_str_radix(key, 16).ok()?;
        self.get(ObjectId(id))
    }

    /// Lookup by name, with or without the `UAVO_` prefix.
    pub fn find_by_name(&self, name: &str) -> Option<&Arc<ObjectDefinition>> {
        let name = name.strip_prefix(NAME_PREFIX).unwrap_or(name);
        self.defs.values().find(|d| d.name() == name)
    }

    /// Settings definitions sorted by name.
    pub fn settings_objects(&self) -> Vec<Arc<ObjectDefinition>> {
        let mut defs: Vec<_> = self.defs.values().filter(|d| d.is_settings()).cloned().collect();
        defs.sort_by(|a, b| a.name().cmp(b.name()));
        defs
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ObjectDefinition>> {
        self.defs.values()
    }

    pub fn keys(&self) -> impl Iterator<Item = String> + '_ {
        self.defs.keys().map(ObjectId::key)
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    /// Writes `<name>.xml` with the canonical description of every
    /// definition into `dir`.
    pub fn write_canonical_xml(&self, dir: impl AsRef<Path>, lowercase: bool) -> Result<(), Error> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        for def in self.defs.values() {
            let name = if lowercase {
                def.name().to_lowercase()
            } else {
                def.name().to_string()
            };
            fs::write(dir.join(format!("{name}.xml")), def.to_xml_description())?;
        }
        Ok(())
    }
}

fn is_reference_error(err: &Error) -> bool {
    matches!(err, Error::UnresolvedReference { .. })
}

/// Name of the object declared by a document, for error reports.
fn definition_name(doc: &str) -> String {
    roxmltree::Document::parse(doc)
        .ok()
        .and_then(|d| {
            d.descendants()
                .find(|n| n.has_tag_name("object"))
                .and_then(|n| n.attribute("name"))
                .map(str::to_string)
        })
        .unwrap_or_else(|| "<unnamed>".to_string())
}

fn tar_documents(reader: impl Read) -> Result<Vec<String>, Error> {
    let mut archive = Archive::new(reader);
    let mut docs = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_string_lossy().into_owned();
        if path.contains("oplinksettings") || !path.ends_with(".xml") {
            continue;
        }
        let mut doc = String::new();
        entry
            .read_to_string(&mut doc)
            .map_err(|err| io::Error::new(err.kind(), format!("{path}: {err}")))?;
        docs.push(doc);
    }
    Ok(docs)
}
