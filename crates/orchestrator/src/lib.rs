//! # Validation orchestrator
//!
//! The per-request workflow: stage uploaded patches into a scratch directory,
//! snapshot the target matrix from the catalogs, run every
//! (patch × firmware) cell under a bounded semaphore, reconcile each cell's
//! applier output against the patch's dependency closure, and publish live
//! progress through the job registry. Cell failures never abort the job;
//! job-level failures (staging, nothing to validate, empty catalogs) fail it
//! with a single user-visible message.

pub mod config;
pub mod response;

pub use config::Config;
pub use response::{CellResult, CompareResponse, MissingHash, ValidationMode, ValidationReport};

use applier::Applier;
use catalog::{HashtabService, SourceTree, TreeService};
use jobs::{JobStatus, JobStore};
use qmd::{find_hash_positions, resolve_load_path, root_level_files, FileStatus};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// An uploaded patch: logical relative path plus raw bytes.
#[derive(Debug, Clone)]
pub struct PatchUpload {
    pub path: String,
    pub bytes: Vec<u8>,
}

/// Job-level failures. Per-cell errors are folded into cells instead.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("failed to stage patches: {0}")]
    Staging(#[from] std::io::Error),

    #[error("no root-level patches to validate")]
    NoRootPatches,

    #[error("no hashtables available")]
    NoHashtables,

    #[error("no QML trees available")]
    NoTrees,
}

/// Ties the catalogs, the applier adapter and the job registry into the
/// per-request validation workflow.
pub struct Orchestrator {
    hashtabs: Arc<HashtabService>,
    trees: Arc<TreeService>,
    jobs: Arc<JobStore>,
    applier: Applier,
    max_concurrent: usize,
}

struct Shared {
    results: BTreeMap<String, Vec<CellResult>>,
    completed: usize,
}

impl Orchestrator {
    pub fn new(
        hashtabs: Arc<HashtabService>,
        trees: Arc<TreeService>,
        jobs: Arc<JobStore>,
        applier: Applier,
        max_concurrent: usize,
    ) -> Self {
        Self {
            hashtabs,
            trees,
            jobs,
            applier,
            max_concurrent: max_concurrent.max(1),
        }
    }

    pub fn jobs(&self) -> &Arc<JobStore> {
        &self.jobs
    }

    /// The set of OS versions for which both a hashtable and a matching tree
    /// exist.
    pub fn validated_versions(&self) -> Vec<String> {
        let trees = self.trees.trees();
        let mut versions: Vec<String> = self
            .hashtabs
            .hashtables()
            .iter()
            .filter(|ht| {
                trees
                    .iter()
                    .any(|t| t.os_version == ht.os_version && t.device == ht.device)
            })
            .map(|ht| ht.os_version.clone())
            .collect();
        versions.sort();
        versions.dedup();
        versions
    }

    /// Runs the whole validation workflow for one job, mutating the job as it
    /// goes. Never returns an error: failures land on the job.
    pub async fn validate(&self, patches: Vec<PatchUpload>, job_id: &str) {
        if let Err(err) = self.run(patches, job_id).await {
            error!(job = job_id, error = %err, "validation failed");
            self.jobs
                .update(job_id, JobStatus::Error, &err.to_string(), None);
        }
    }

    async fn run(
        &self,
        patches: Vec<PatchUpload>,
        job_id: &str,
    ) -> Result<(), OrchestratorError> {
        // 1. Stage uploads into a scratch directory, preserving relative
        // paths. The directory lives until this function returns.
        let staging = tempfile::tempdir()?;
        let mut staged: Vec<PathBuf> = Vec::new();
        let mut contents: BTreeMap<String, String> = BTreeMap::new();

        for patch in &patches {
            if patch.bytes.is_empty() {
                warn!(file = %patch.path, "skipping empty patch");
                continue;
            }
            let rel = qmd::path_util::clean_path(std::path::Path::new(&patch.path));
            let target = staging.path().join(&rel);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&target, &patch.bytes)?;
            contents.insert(
                rel.to_string_lossy().into_owned(),
                String::from_utf8_lossy(&patch.bytes).into_owned(),
            );
            staged.push(target);
        }

        // 2. Only top-level patches are validation roots; patches in
        // subdirectories are reached as dependencies.
        let roots = root_level_files(staging.path(), &staged);
        if roots.is_empty() {
            return Err(OrchestratorError::NoRootPatches);
        }
        let root_names: Vec<String> = roots
            .iter()
            .map(|p| {
                p.strip_prefix(staging.path())
                    .map(|r| r.to_string_lossy().into_owned())
                    .unwrap_or_else(|_| p.display().to_string())
            })
            .collect();

        info!(job = job_id, roots = roots.len(), "starting validation");
        self.jobs.update_with_operation(
            job_id,
            JobStatus::Running,
            "Processing patches",
            None,
            "parsing",
        );
        self.jobs.update_progress(job_id, 10);

        // 3. Snapshot the target matrix.
        let hashtables = self.hashtabs.hashtables();
        if hashtables.is_empty() {
            return Err(OrchestratorError::NoHashtables);
        }
        let trees = self.trees.trees();
        if trees.is_empty() {
            return Err(OrchestratorError::NoTrees);
        }
        let total = hashtables.len();

        let shared = Arc::new(Mutex::new(Shared {
            results: root_names
                .iter()
                .map(|name| (name.clone(), Vec::new()))
                .collect(),
            completed: 0,
        }));
        let root_list: Arc<Vec<(String, PathBuf)>> = Arc::new(
            root_names.iter().cloned().zip(roots.iter().cloned()).collect(),
        );
        let contents = Arc::new(contents);

        // 4. One task per hashtable, bounded by the semaphore.
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut workers: JoinSet<()> = JoinSet::new();
        info!(
            job = job_id,
            max_concurrent = self.max_concurrent,
            hashtables = total,
            "scheduling validation cells"
        );

        for hashtable in hashtables {
            let semaphore = Arc::clone(&semaphore);
            let shared = Arc::clone(&shared);
            let root_list = Arc::clone(&root_list);
            let contents = Arc::clone(&contents);
            let jobs = Arc::clone(&self.jobs);
            let applier = self.applier.clone();
            let job_id = job_id.to_string();
            let matching_tree: Option<Arc<SourceTree>> = trees
                .iter()
                .find(|t| {
                    t.os_version == hashtable.os_version && t.device == hashtable.device
                })
                .cloned();

            workers.spawn(async move {
                // Job cleaned up mid-flight: stop scheduling new cells.
                if !jobs.exists(&job_id) {
                    return;
                }
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };

                let cells: Vec<(String, CellResult)> = match matching_tree {
                    None => {
                        warn!(
                            hashtable = %hashtable.name,
                            os_version = %hashtable.os_version,
                            device = %hashtable.device,
                            "no matching tree, using legacy mode"
                        );
                        root_list
                            .iter()
                            .map(|(name, _)| {
                                let mut cell = CellResult::new(
                                    &hashtable.name,
                                    &hashtable.os_version,
                                    &hashtable.device,
                                );
                                cell.compatible = true;
                                cell.validation_mode = ValidationMode::Hash;
                                cell.tree_validation_used = false;
                                cell.error_detail =
                                    "tree unavailable, using legacy mode".to_string();
                                (name.clone(), cell)
                            })
                            .collect()
                    }
                    Some(tree) => {
                        let block_hashtable = Arc::clone(&hashtable);
                        let block_roots = Arc::clone(&root_list);
                        let block_contents = Arc::clone(&contents);
                        let blocking = tokio::task::spawn_blocking(move || {
                            validate_cell(
                                &applier,
                                &block_hashtable,
                                &tree,
                                &block_roots,
                                &block_contents,
                            )
                        })
                        .await;
                        match blocking {
                            Ok(cells) => cells,
                            Err(join_err) => {
                                // Contain cell panics at the task boundary.
                                error!(
                                    hashtable = %hashtable.name,
                                    error = %join_err,
                                    "validation cell panicked"
                                );
                                root_list
                                    .iter()
                                    .map(|(name, _)| {
                                        let mut cell = CellResult::new(
                                            &hashtable.name,
                                            &hashtable.os_version,
                                            &hashtable.device,
                                        );
                                        cell.error_detail =
                                            "validation worker failed".to_string();
                                        (name.clone(), cell)
                                    })
                                    .collect()
                            }
                        }
                    }
                };

                let mut shared = shared.lock().expect("results lock poisoned");
                for (root, cell) in cells {
                    shared.results.entry(root).or_default().push(cell);
                }
                shared.completed += 1;
                let progress =
                    10 + (90.0 * shared.completed as f64 / total as f64).round() as i32;
                jobs.update_progress(&job_id, progress);
            });
        }

        // 5. Wait for every worker; a panicked worker is logged, not fatal.
        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                error!(job = job_id, error = %err, "worker task failed");
            }
        }

        let shared = Arc::try_unwrap(shared)
            .map(|m| m.into_inner().expect("results lock poisoned"))
            .unwrap_or_else(|arc| arc.lock().expect("results lock poisoned").clone_inner());

        // 6. Flatten and publish.
        let report = flatten(shared.results, &root_list);
        let payload = serde_json::to_value(&report).unwrap_or_default();
        self.jobs.set_results(job_id, payload);
        self.jobs
            .update(job_id, JobStatus::Success, "validation complete", None);
        info!(job = job_id, "validation complete");
        Ok(())
    }
}

impl Shared {
    fn clone_inner(&self) -> Shared {
        Shared {
            results: self.results.clone(),
            completed: self.completed,
        }
    }
}

/// Validates every root patch against one (hashtable, tree) pair. Runs on a
/// blocking thread: the applier subprocess can take seconds to minutes.
fn validate_cell(
    applier: &Applier,
    hashtable: &catalog::Hashtab,
    tree: &SourceTree,
    root_list: &[(String, PathBuf)],
    contents: &BTreeMap<String, String>,
) -> Vec<(String, CellResult)> {
    let mut cells = Vec::with_capacity(root_list.len());

    for (root_name, root_path) in root_list {
        info!(
            patch = %root_name,
            hashtable = %hashtable.name,
            tree = %tree.name,
            "validating cell"
        );
        let mut cell = CellResult::new(&hashtable.name, &hashtable.os_version, &hashtable.device);

        match applier.validate_patch(root_path, &hashtable.path, &tree.path) {
            Err(err) => {
                warn!(
                    patch = %root_name,
                    hashtable = %hashtable.name,
                    error = %err,
                    "cell validation error"
                );
                cell.compatible = false;
                cell.error_detail = format!("validation error: {err}");
            }
            Ok(outcome) => {
                cell.compatible = outcome.files_with_errors == 0;
                cell.files_processed = outcome.files_processed;
                cell.files_modified = outcome.files_modified;
                cell.files_with_errors = outcome.files_with_errors;
                cell.dependency_results = outcome.dependency_results;

                if !outcome.failed_hashes.is_empty() {
                    let positions = contents
                        .get(root_name)
                        .map(|text| find_hash_positions(text, &outcome.failed_hashes))
                        .unwrap_or_default();
                    cell.missing_hashes =
                        positions.into_iter().map(MissingHash::from).collect();
                    cell.error_detail =
                        format!("missing {} hash(es)", cell.missing_hashes.len());
                } else if !cell.compatible {
                    cell.error_detail =
                        format!("{} files with errors", outcome.files_with_errors);
                }
            }
        }

        cells.push((root_name.clone(), cell));
    }

    cells
}

/// Flattens per-root cell lists into the final report shape. A lone root with
/// no dependencies gets the flat historical response; anything richer becomes
/// a map with one synthesized per-firmware row per dependency file.
fn flatten(
    results: BTreeMap<String, Vec<CellResult>>,
    root_list: &[(String, PathBuf)],
) -> ValidationReport {
    let has_dependencies = results.values().flatten().any(|cell| {
        cell.dependency_results
            .values()
            .any(|result| result.position >= 0)
    });

    if results.len() == 1 && !has_dependencies {
        let cells = results.into_values().next().unwrap_or_default();
        return ValidationReport::Single(CompareResponse::from_cells(
            cells,
            ValidationMode::Tree,
        ));
    }

    let root_paths: BTreeMap<&str, &PathBuf> = root_list
        .iter()
        .map(|(name, path)| (name.as_str(), path))
        .collect();

    let mut batch: BTreeMap<String, CompareResponse> = BTreeMap::new();
    let mut dependency_cells: Vec<(String, CellResult)> = Vec::new();

    for (root_name, cells) in results {
        for cell in &cells {
            for (dep_path, dep_result) in &cell.dependency_results {
                if dep_result.position < 0 {
                    continue;
                }
                let dep_cell = synthesize_dependency_cell(
                    cell,
                    dep_path,
                    dep_result,
                    root_paths.get(root_name.as_str()).copied(),
                );
                dependency_cells.push((dep_path.clone(), dep_cell));
            }
        }
        batch.insert(
            root_name,
            CompareResponse::from_cells(cells, ValidationMode::Tree),
        );
    }

    for (dep_path, dep_cell) in dependency_cells {
        batch
            .entry(dep_path)
            .or_insert_with(|| CompareResponse::empty(ValidationMode::Tree))
            .push(dep_cell);
    }

    ValidationReport::Batch(batch)
}

/// One per-firmware row for a dependency file, with source positions attached
/// when the dependency's text can still be read.
fn synthesize_dependency_cell(
    parent: &CellResult,
    dep_path: &str,
    dep_result: &qmd::ValidationResult,
    root_path: Option<&PathBuf>,
) -> CellResult {
    let mut cell = CellResult::new(&parent.hashtable, &parent.os_version, &parent.device);
    cell.compatible = dep_result.compatible;

    if dep_result.compatible {
        return cell;
    }

    if !dep_result.hash_errors.is_empty() {
        let hash_ids: Vec<u64> = dep_result.hash_errors.iter().map(|e| e.hash_id).collect();
        let located = root_path
            .map(|root| resolve_load_path(root, dep_path))
            .and_then(|dep_abs| std::fs::read_to_string(dep_abs).ok())
            .map(|text| find_hash_positions(&text, &hash_ids))
            .unwrap_or_default();

        if located.is_empty() {
            // The hashes live in files referenced further down; report the
            // IDs without positions.
            cell.missing_hashes = hash_ids
                .iter()
                .map(|&hash| MissingHash {
                    hash,
                    line: 0,
                    column: 0,
                })
                .collect();
            cell.error_detail = format!("{} hash lookup error(s)", hash_ids.len());
        } else {
            cell.missing_hashes = located.into_iter().map(MissingHash::from).collect();
            cell.error_detail = format!("missing {} hash(es)", cell.missing_hashes.len());
        }
    } else if !dep_result.process_errors.is_empty() {
        cell.error_detail = dep_result.process_errors.join("; ");
    } else if dep_result.status == FileStatus::NotAttempted {
        cell.error_detail = match &dep_result.blocked_by {
            Some(blocked_by) => {
                format!("Not validated due to failure of dependency {blocked_by}")
            }
            None => "Not attempted due to prior failure".to_string(),
        };
    } else {
        cell.error_detail = "validation failed".to_string();
    }

    cell
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn tmp_dir(name: &str) -> PathBuf {
        let d = std::env::temp_dir().join(name);
        fs::remove_dir_all(&d).ok();
        fs::create_dir_all(&d).ok();
        d
    }

    fn fake_applier(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-applier");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path
    }

    /// Builds a workbench: hashtable files (empty record streams are valid),
    /// tree directories, a scripted applier and a wired-up orchestrator.
    fn setup(
        root: &Path,
        applier_body: &str,
        hashtab_names: &[&str],
        tree_names: &[&str],
    ) -> Orchestrator {
        let hashtab_dir = root.join("hashtables");
        fs::create_dir_all(&hashtab_dir).unwrap();
        for name in hashtab_names {
            fs::write(hashtab_dir.join(name), b"").unwrap();
        }

        let tree_dir = root.join("trees");
        fs::create_dir_all(&tree_dir).unwrap();
        for name in tree_names {
            let tree = tree_dir.join(name);
            fs::create_dir_all(&tree).unwrap();
            fs::write(tree.join("home.qml"), "Item {}").unwrap();
        }

        let bin = fake_applier(root, applier_body);

        Orchestrator::new(
            Arc::new(HashtabService::new(&hashtab_dir).unwrap()),
            Arc::new(TreeService::new(&tree_dir).unwrap()),
            JobStore::new(),
            Applier::new(&bin),
            2,
        )
    }

    fn upload(path: &str, body: &str) -> PatchUpload {
        PatchUpload {
            path: path.to_string(),
            bytes: body.as_bytes().to_vec(),
        }
    }

    async fn run_job(orch: &Orchestrator, patches: Vec<PatchUpload>) -> jobs::Job {
        let job_id = uuid::Uuid::new_v4().to_string();
        orch.jobs().create(&job_id);
        orch.validate(patches, &job_id).await;
        orch.jobs().get(&job_id).unwrap()
    }

    const CLEAN_APPLIER: &str = r#"case "$1" in
check-compatibility) exit 0 ;;
apply-diffs) echo "Written file home.qml - 1 diff(s) applied"; exit 0 ;;
esac"#;

    #[tokio::test]
    async fn test_single_clean_patch_flat_response() {
        let tmp = tmp_dir("orch_clean");
        let orch = setup(&tmp, CLEAN_APPLIER, &["1.0-rm2"], &["1.0-rm2"]);

        let job = run_job(&orch, vec![upload("mod.qmd", "LOAD EXTERNAL foo\n")]).await;
        assert_eq!(job.status, JobStatus::Success);
        assert_eq!(job.progress, 100);

        let results = job.results.unwrap();
        let compatible = results["compatible"].as_array().unwrap();
        assert_eq!(compatible.len(), 1);
        assert!(results["incompatible"].as_array().unwrap().is_empty());
        assert_eq!(results["total_checked"], 1);
        assert_eq!(results["mode"], "tree");

        let cell = &compatible[0];
        assert_eq!(cell["hashtable"], "1.0-rm2");
        assert_eq!(cell["validation_mode"], "tree");
        assert_eq!(cell["tree_validation_used"], true);
        assert_eq!(
            cell["dependency_results"]["mod.qmd"]["status"],
            "validated"
        );

        fs::remove_dir_all(tmp).ok();
    }

    #[tokio::test]
    async fn test_missing_hash_skips_structural_phase() {
        let tmp = tmp_dir("orch_missing_hash");
        let marker = tmp.join("phase-b-ran");
        let body = format!(
            r#"case "$1" in
check-compatibility) echo "mod.qmd - Cannot resolve hash 12345"; exit 1 ;;
apply-diffs) touch {} ; exit 9 ;;
esac"#,
            marker.display()
        );
        let orch = setup(&tmp, &body, &["1.0-rm2"], &["1.0-rm2"]);

        let job = run_job(&orch, vec![upload("mod.qmd", "apply 12345 now\n")]).await;
        assert_eq!(job.status, JobStatus::Success);

        let results = job.results.unwrap();
        let incompatible = results["incompatible"].as_array().unwrap();
        assert_eq!(incompatible.len(), 1);
        let cell = &incompatible[0];
        assert_eq!(cell["compatible"], false);
        assert_eq!(cell["error_detail"], "missing 1 hash(es)");
        assert_eq!(cell["missing_hashes"][0]["hash"], "12345");
        assert_eq!(cell["missing_hashes"][0]["line"], 1);
        assert_eq!(cell["missing_hashes"][0]["column"], 7);

        assert!(!marker.exists(), "structural phase must not run");

        fs::remove_dir_all(tmp).ok();
    }

    #[tokio::test]
    async fn test_tree_unavailable_cell() {
        let tmp = tmp_dir("orch_no_tree");
        let orch = setup(&tmp, CLEAN_APPLIER, &["2.0-rmpp"], &["9.9-zz"]);

        let job = run_job(&orch, vec![upload("mod.qmd", "LOAD EXTERNAL foo\n")]).await;
        assert_eq!(job.status, JobStatus::Success);

        let results = job.results.unwrap();
        let compatible = results["compatible"].as_array().unwrap();
        assert_eq!(compatible.len(), 1);
        let cell = &compatible[0];
        assert_eq!(cell["validation_mode"], "hash");
        assert_eq!(cell["tree_validation_used"], false);
        assert_eq!(cell["error_detail"], "tree unavailable, using legacy mode");

        fs::remove_dir_all(tmp).ok();
    }

    #[tokio::test]
    async fn test_no_root_patches_fails_job() {
        let tmp = tmp_dir("orch_no_roots");
        let orch = setup(&tmp, CLEAN_APPLIER, &["1.0-rm2"], &["1.0-rm2"]);

        let job = run_job(&orch, vec![upload("deps/a.qmd", "LOAD EXTERNAL x\n")]).await;
        assert_eq!(job.status, JobStatus::Error);
        assert!(job.message.contains("no root-level patches"));

        fs::remove_dir_all(tmp).ok();
    }

    #[tokio::test]
    async fn test_empty_patches_are_skipped() {
        let tmp = tmp_dir("orch_empty_file");
        let orch = setup(&tmp, CLEAN_APPLIER, &["1.0-rm2"], &["1.0-rm2"]);

        let job = run_job(&orch, vec![upload("mod.qmd", "")]).await;
        assert_eq!(job.status, JobStatus::Error);

        fs::remove_dir_all(tmp).ok();
    }

    #[tokio::test]
    async fn test_no_hashtables_fails_job() {
        let tmp = tmp_dir("orch_no_hashtabs");
        let orch = setup(&tmp, CLEAN_APPLIER, &[], &["1.0-rm2"]);

        let job = run_job(&orch, vec![upload("mod.qmd", "x\n")]).await;
        assert_eq!(job.status, JobStatus::Error);
        assert!(job.message.contains("no hashtables"));

        fs::remove_dir_all(tmp).ok();
    }

    #[tokio::test]
    async fn test_multi_root_batch_and_progress() {
        let tmp = tmp_dir("orch_multi");
        let orch = setup(
            &tmp,
            CLEAN_APPLIER,
            &["1.0-rm2", "2.0-rmpp"],
            &["1.0-rm2", "2.0-rmpp"],
        );

        let job_id = uuid::Uuid::new_v4().to_string();
        orch.jobs().create(&job_id);
        let (mut rx, _sub) = orch.jobs().subscribe(&job_id);
        orch.validate(
            vec![
                upload("first.qmd", "LOAD EXTERNAL a\n"),
                upload("second.qmd", "LOAD EXTERNAL b\n"),
            ],
            &job_id,
        )
        .await;

        let job = orch.jobs().get(&job_id).unwrap();
        assert_eq!(job.status, JobStatus::Success);

        let results = job.results.unwrap();
        for root in ["first.qmd", "second.qmd"] {
            assert_eq!(results[root]["total_checked"], 2, "roots get one cell per hashtable");
        }

        // Progress over any one channel is monotonic and ends complete.
        let mut last_progress = -1;
        let mut saw_running = false;
        let mut final_status = JobStatus::Pending;
        while let Ok(snap) = rx.try_recv() {
            assert!(snap.progress >= last_progress);
            last_progress = snap.progress;
            if snap.status == JobStatus::Running {
                saw_running = true;
            }
            final_status = snap.status;
        }
        assert!(saw_running);
        assert_eq!(final_status, JobStatus::Success);
        assert_eq!(last_progress, 100);

        fs::remove_dir_all(tmp).ok();
    }

    #[tokio::test]
    async fn test_dependency_rows_synthesized() {
        let tmp = tmp_dir("orch_deps");
        let body = r#"case "$1" in
check-compatibility) exit 0 ;;
apply-diffs) echo "Cannot resolve hash 55 required by deps/a.qmd"; exit 1 ;;
esac"#;
        let orch = setup(&tmp, body, &["1.0-rm2"], &["1.0-rm2"]);

        let job = run_job(
            &orch,
            vec![
                upload("mod.qmd", "LOAD deps/a.qmd\n"),
                upload("deps/a.qmd", "hash 55 here\n"),
            ],
        )
        .await;
        assert_eq!(job.status, JobStatus::Success);

        let results = job.results.unwrap();

        // The root failed because its dependency carries a hash error.
        let root_cells = results["mod.qmd"]["incompatible"].as_array().unwrap();
        assert_eq!(root_cells.len(), 1);
        assert_eq!(root_cells[0]["files_with_errors"], 1);

        // The dependency got its own per-firmware row, with positions located
        // in the dependency's text.
        let dep = &results["deps/a.qmd"];
        assert_eq!(dep["total_checked"], 1);
        let dep_cell = &dep["incompatible"].as_array().unwrap()[0];
        assert_eq!(dep_cell["error_detail"], "missing 1 hash(es)");
        assert_eq!(dep_cell["missing_hashes"][0]["hash"], "55");
        assert_eq!(dep_cell["missing_hashes"][0]["line"], 1);
        assert_eq!(dep_cell["missing_hashes"][0]["column"], 6);

        fs::remove_dir_all(tmp).ok();
    }

    #[tokio::test]
    async fn test_blocked_dependency_row_names_blocker() {
        let tmp = tmp_dir("orch_blocked");
        let body = r#"case "$1" in
check-compatibility) exit 0 ;;
apply-diffs) echo "Cannot read file deps/a.qmd"; exit 1 ;;
esac"#;
        let orch = setup(&tmp, body, &["1.0-rm2"], &["1.0-rm2"]);

        let job = run_job(
            &orch,
            vec![
                upload("mod.qmd", "LOAD deps/a.qmd\nLOAD deps/b.qmd\n"),
                upload("deps/b.qmd", "fine\n"),
            ],
        )
        .await;
        assert_eq!(job.status, JobStatus::Success);

        let results = job.results.unwrap();
        let blocked = &results["deps/b.qmd"]["incompatible"].as_array().unwrap()[0];
        assert!(blocked["error_detail"]
            .as_str()
            .unwrap()
            .contains("deps/a.qmd"));

        fs::remove_dir_all(tmp).ok();
    }

    #[tokio::test]
    async fn test_validated_versions_requires_matching_tree() {
        let tmp = tmp_dir("orch_versions");
        let orch = setup(
            &tmp,
            CLEAN_APPLIER,
            &["1.0-rm2", "2.0-rmpp"],
            &["1.0-rm2"],
        );

        assert_eq!(orch.validated_versions(), vec!["1.0".to_string()]);

        fs::remove_dir_all(tmp).ok();
    }

    #[tokio::test]
    async fn test_rerun_is_deterministic() {
        let tmp = tmp_dir("orch_rerun");
        let orch = setup(&tmp, CLEAN_APPLIER, &["1.0-rm2"], &["1.0-rm2"]);

        let first = run_job(&orch, vec![upload("mod.qmd", "LOAD EXTERNAL x\n")]).await;
        let second = run_job(&orch, vec![upload("mod.qmd", "LOAD EXTERNAL x\n")]).await;
        assert_eq!(first.results.unwrap(), second.results.unwrap());

        fs::remove_dir_all(tmp).ok();
    }
}
