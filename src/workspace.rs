use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::chunker::Chunker;
use crate::config::Config;
use crate::embedder::Embedder;
use crate::error::{Error, Result};
use crate::indexer::{IndexReport, Indexer};
use crate::scanner::Scanner;
use crate::searcher::Searcher;
use crate::store::{SearchResult, VectorStore};

/// One project inside a workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceProject {
    pub name: String,
    pub root: PathBuf,
}

/// A named bundle of projects sharing one store. Stored paths are
/// namespaced as `workspace_name/project_name/relative_path`, so one
/// collection serves every member and per-project queries reduce to path
/// prefixes.
pub struct Workspace {
    name: String,
    projects: Vec<WorkspaceProject>,
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    config: Config,
}

impl Workspace {
    pub fn new(
        name: impl Into<String>,
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
        config: Config,
    ) -> Result<Self> {
        let name = name.into();
        if name.is_empty() || name.contains('/') {
            return Err(Error::config(format!("invalid workspace name: {name:?}")));
        }
        Ok(Self {
            name,
            projects: Vec::new(),
            embedder,
            store,
            config,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn projects(&self) -> &[WorkspaceProject] {
        &self.projects
    }

    pub fn add_project(&mut self, name: impl Into<String>, root: impl Into<PathBuf>) -> Result<()> {
        let name = name.into();
        if name.is_empty() || name.contains('/') {
            return Err(Error::config(format!("invalid project name: {name:?}")));
        }
        if self.projects.iter().any(|p| p.name == name) {
            return Err(Error::config(format!(
                "project {name:?} already in workspace {}",
                self.name
            )));
        }
        self.projects.push(WorkspaceProject {
            name,
            root: root.into(),
        });
        Ok(())
    }

    fn namespace(&self, project: &str) -> String {
        format!("{}/{project}", self.name)
    }

    fn require_project(&self, name: &str) -> Result<&WorkspaceProject> {
        self.projects
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| Error::NotFound(format!("project {name:?} in workspace {}", self.name)))
    }

    /// Index every member project into the shared store. Reports are summed.
    pub async fn index_all(&self, cancel: &CancellationToken) -> Result<IndexReport> {
        let mut total = IndexReport::default();
        for project in &self.projects {
            let report = self.index_project(&project.name, cancel).await?;
            total.files_indexed += report.files_indexed;
            total.files_skipped += report.files_skipped;
            total.chunks_created += report.chunks_created;
            total.files_removed += report.files_removed;
            total.duration += report.duration;
        }
        info!(
            workspace = %self.name,
            projects = self.projects.len(),
            indexed = total.files_indexed,
            "workspace indexing complete"
        );
        Ok(total)
    }

    pub async fn index_project(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<IndexReport> {
        let project = self.require_project(name)?;
        let indexer = Indexer::new(
            Scanner::new(&project.root, &self.config.indexer)?,
            Chunker::new(&self.config.indexer),
            self.embedder.clone(),
            self.store.clone(),
        )
        .with_namespace(self.namespace(&project.name));
        indexer.index_all(cancel).await
    }

    /// Query the workspace. `projects` of `None` searches every member; a
    /// single name is pushed down as a path prefix; a subset is filtered
    /// client-side after over-fetched retrieval.
    pub async fn search(
        &self,
        query: &str,
        limit: usize,
        projects: Option<&[String]>,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchResult>> {
        let searcher = self.searcher();

        match projects {
            None => {
                let prefix = format!("{}/", self.name);
                searcher
                    .search_raw(query, limit, Some(&prefix), cancel)
                    .await
            }
            Some([single]) => {
                self.require_project(single)?;
                let prefix = format!("{}/", self.namespace(single));
                searcher
                    .search_raw(query, limit, Some(&prefix), cancel)
                    .await
            }
            Some(subset) => {
                for name in subset {
                    self.require_project(name)?;
                }
                let allowed: Vec<String> = subset
                    .iter()
                    .map(|name| format!("{}/", self.namespace(name)))
                    .collect();

                // Over-fetch across the whole workspace, then keep only the
                // requested projects.
                let prefix = format!("{}/", self.name);
                let mut results = searcher
                    .search_raw(query, limit.saturating_mul(3), Some(&prefix), cancel)
                    .await?;
                results.retain(|r| allowed.iter().any(|a| r.chunk.file_path.starts_with(a.as_str())));
                results.truncate(limit);
                Ok(results)
            }
        }
    }

    fn searcher(&self) -> Searcher {
        Searcher::new(
            self.embedder.clone(),
            self.store.clone(),
            self.config.search.clone(),
            PathBuf::from("."),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::SyntheticEmbedder;
    use crate::store::BinaryStore;
    use std::fs;
    use tempfile::tempdir;

    fn workspace_with(store: Arc<dyn VectorStore>) -> Workspace {
        Workspace::new(
            "team",
            Arc::new(SyntheticEmbedder::new(64)),
            store,
            Config::default(),
        )
        .unwrap()
    }

    #[test]
    fn names_with_separators_are_rejected() {
        let store: Arc<dyn VectorStore> =
            Arc::new(BinaryStore::new(PathBuf::from("/tmp/x.bin")));
        assert!(Workspace::new(
            "bad/name",
            Arc::new(SyntheticEmbedder::new(8)),
            store.clone(),
            Config::default(),
        )
        .is_err());

        let mut ws = workspace_with(store);
        assert!(ws.add_project("ok", "/tmp/a").is_ok());
        assert!(ws.add_project("not/ok", "/tmp/b").is_err());
        assert!(ws.add_project("ok", "/tmp/c").is_err());
    }

    #[tokio::test]
    async fn unknown_project_is_not_found() {
        let store: Arc<dyn VectorStore> =
            Arc::new(BinaryStore::new(PathBuf::from("/tmp/x.bin")));
        let ws = workspace_with(store);
        let cancel = CancellationToken::new();

        let err = ws
            .search("query", 5, Some(&["ghost".to_string()]), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn projects_share_one_namespaced_store() {
        let dir_a = tempdir().unwrap();
        let dir_b = tempdir().unwrap();
        fs::write(
            dir_a.path().join("auth.rs"),
            "fn authenticate_user() { validate login credentials }\n",
        )
        .unwrap();
        fs::write(
            dir_b.path().join("net.rs"),
            "fn open_socket() { tcp connection setup }\n",
        )
        .unwrap();

        let store: Arc<dyn VectorStore> = Arc::new(BinaryStore::new(
            dir_a.path().join(".grepai/index.bin"),
        ));
        let mut ws = workspace_with(store.clone());
        ws.add_project("alpha", dir_a.path()).unwrap();
        ws.add_project("beta", dir_b.path()).unwrap();

        let cancel = CancellationToken::new();
        let report = ws.index_all(&cancel).await.unwrap();
        assert_eq!(report.files_indexed, 2);
        assert_eq!(
            store.list_documents().await.unwrap(),
            vec!["team/alpha/auth.rs", "team/beta/net.rs"]
        );

        // Whole-workspace search sees both projects.
        let all = ws.search("login tcp", 10, None, &cancel).await.unwrap();
        assert_eq!(all.len(), 2);

        // Single-project search is narrowed by prefix.
        let only_alpha = ws
            .search("login", 10, Some(&["alpha".to_string()]), &cancel)
            .await
            .unwrap();
        assert!(!only_alpha.is_empty());
        assert!(only_alpha
            .iter()
            .all(|r| r.chunk.file_path.starts_with("team/alpha/")));

        // Subset search filters client-side.
        let subset = ws
            .search(
                "anything",
                10,
                Some(&["beta".to_string(), "alpha".to_string()]),
                &cancel,
            )
            .await
            .unwrap();
        assert!(subset
            .iter()
            .all(|r| r.chunk.file_path.starts_with("team/")));
    }
}
