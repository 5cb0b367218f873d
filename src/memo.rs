//! Completion markers.
//!
//! A finished task writes a JSON marker next to its outputs. Under the
//! content policy the marker records a fingerprint of everything the task
//! was computed from together with the hash of every output, so a task is
//! re-executed when an input changes even if no timestamp moved.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::time::SystemTime;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::config::CachePolicy;
use crate::core::{Fingerprint, Hash32};
use crate::error::BuildError;
use crate::graph::TaskNode;
use crate::rule::Action;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct MemoRecord {
    pub task: String,
    pub fingerprint: Hash32,
    pub outputs: BTreeMap<Utf8PathBuf, Hash32>,
}

/// Hash of everything that determines what `node` produces.
pub(crate) fn fingerprint(node: &TaskNode, root: &Utf8Path) -> io::Result<Hash32> {
    let mut fp = Fingerprint::new();

    fp.field(&node.id.rule);
    for (key, value) in &node.id.wildcards {
        fp.field(key).field(value);
    }

    fp.field(node.action.signature());
    if let Action::Notebook(path) = &node.action {
        let path = root.join(path);
        if path.is_file() {
            fp.field(Hash32::hash_file(&path)?.to_hex());
        }
    }

    if let Some(env) = &node.env {
        fp.field(env.to_string());
    }

    for (key, value) in &node.params {
        fp.field(key).field(value);
    }

    for input in &node.inputs {
        fp.field(input.as_str());
        fp.field(hash_path(&root.join(input))?.to_hex());
    }

    Ok(fp.finish())
}

/// Content hash of a file, or of a whole directory tree.
fn hash_path(path: &Utf8Path) -> io::Result<Hash32> {
    if !path.is_dir() {
        return Hash32::hash_file(path);
    }

    let pattern = format!("{}/**/*", glob::Pattern::escape(path.as_str()));
    let entries = glob::glob(&pattern).map_err(io::Error::other)?;

    let mut fp = Fingerprint::new();
    for entry in entries {
        let entry = entry.map_err(io::Error::from)?;
        if entry.is_dir() {
            continue;
        }
        let relative = entry.strip_prefix(path).map_err(io::Error::other)?;
        fp.field(relative.to_string_lossy().as_bytes());
        fp.field(Hash32::hash_file(&entry)?.to_hex());
    }

    Ok(fp.finish())
}

/// Why `node` must run, or `None` when its products can be reused.
pub(crate) fn staleness(
    node: &TaskNode,
    root: &Utf8Path,
    policy: CachePolicy,
    fingerprint: Hash32,
) -> Option<String> {
    let marker = node.marker.as_ref()?;
    let marker = root.join(marker);

    if !marker.exists() {
        return Some("no completion marker".into());
    }
    if let Some(missing) = node.outputs.iter().find(|out| !root.join(out).exists()) {
        return Some(format!("missing output {missing}"));
    }

    match policy {
        CachePolicy::Content => {
            let record = match read_record(&marker) {
                Ok(record) => record,
                Err(e) => return Some(format!("unreadable marker: {e}")),
            };
            if record.fingerprint != fingerprint {
                return Some("inputs changed".into());
            }
            for output in &node.outputs {
                let current = hash_path(&root.join(output)).ok();
                if current.is_none() || record.outputs.get(output) != current.as_ref() {
                    return Some(format!("output {output} changed"));
                }
            }
            None
        }
        CachePolicy::Timestamp => {
            let oldest_product = node
                .outputs
                .iter()
                .map(|out| root.join(out))
                .chain([marker])
                .map(|path| modified(&path))
                .min()
                .flatten();
            let newest_input = node
                .inputs
                .iter()
                .map(|input| modified(&root.join(input)))
                .max()
                .flatten();

            match (oldest_product, newest_input) {
                (Some(product), Some(input)) if product < input => {
                    Some("inputs are newer than outputs".into())
                }
                (None, _) => Some("output timestamps unavailable".into()),
                _ => None,
            }
        }
    }
}

fn modified(path: &Utf8Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn read_record(marker: &Utf8Path) -> Result<MemoRecord, BuildError> {
    let text = fs::read_to_string(marker)?;
    Ok(serde_json::from_str(&text)?)
}

/// Writes the completion marker of a successfully executed task.
pub(crate) fn record(node: &TaskNode, root: &Utf8Path, fingerprint: Hash32) -> Result<(), BuildError> {
    let Some(marker) = &node.marker else {
        return Ok(());
    };

    let mut outputs = BTreeMap::new();
    for output in &node.outputs {
        outputs.insert(output.clone(), hash_path(&root.join(output))?);
    }

    let record = MemoRecord {
        task: node.id.to_string(),
        fingerprint,
        outputs,
    };

    let marker = root.join(marker);
    if let Some(parent) = marker.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&marker, serde_json::to_vec_pretty(&record)?)?;
    Ok(())
}

/// Removes the marker and every declared output of `node`.
pub(crate) fn invalidate(node: &TaskNode, root: &Utf8Path) -> io::Result<()> {
    for path in node.products() {
        let path = root.join(path);
        let result = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        match result {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::TaskId;
    use crate::rule::Expects;

    fn tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, root)
    }

    fn node() -> TaskNode {
        TaskNode {
            id: TaskId {
                rule: "qc".into(),
                wildcards: vec![("sample", "A".into())],
            },
            tag: "A".into(),
            inputs: vec!["in.txt".into()],
            outputs: vec!["out/A.cbor".into()],
            marker: Some("out/A.cbor.done".into()),
            env: None,
            action: Action::Aggregate,
            params: BTreeMap::new(),
            expects: Expects::default(),
        }
    }

    fn produce(root: &Utf8Path, node: &TaskNode) -> Hash32 {
        let fp = fingerprint(node, root).unwrap();
        fs::create_dir_all(root.join("out")).unwrap();
        fs::write(root.join("out/A.cbor"), "result").unwrap();
        record(node, root, fp).unwrap();
        fp
    }

    #[test]
    fn test_fresh_after_record() {
        let (_dir, root) = tempdir();
        fs::write(root.join("in.txt"), "v1").unwrap();
        let node = node();

        assert!(staleness(&node, &root, CachePolicy::Content, fingerprint(&node, &root).unwrap()).is_some());

        let fp = produce(&root, &node);
        assert_eq!(staleness(&node, &root, CachePolicy::Content, fp), None);
        assert_eq!(staleness(&node, &root, CachePolicy::Timestamp, fp), None);
    }

    fn set_mtime(path: &Utf8Path, time: SystemTime) {
        fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(time)
            .unwrap();
    }

    #[test]
    fn test_timestamp_newer_input_is_stale() {
        let (_dir, root) = tempdir();
        fs::write(root.join("in.txt"), "v1").unwrap();
        let node = node();
        let fp = produce(&root, &node);

        let later = SystemTime::now() + std::time::Duration::from_secs(3600);
        set_mtime(&root.join("in.txt"), later);

        assert_eq!(
            staleness(&node, &root, CachePolicy::Timestamp, fp).as_deref(),
            Some("inputs are newer than outputs")
        );
    }

    #[test]
    fn test_timestamp_misses_content_change_without_mtime() {
        let (_dir, root) = tempdir();
        let input = root.join("in.txt");
        fs::write(&input, "v1").unwrap();
        let node = node();
        produce(&root, &node);

        let before = fs::metadata(&input).unwrap().modified().unwrap();
        fs::write(&input, "v2").unwrap();
        set_mtime(&input, before);

        let fp = fingerprint(&node, &root).unwrap();
        assert_eq!(staleness(&node, &root, CachePolicy::Timestamp, fp), None);
        assert!(staleness(&node, &root, CachePolicy::Content, fp).is_some());
    }

    #[test]
    fn test_input_content_change_is_detected() {
        let (_dir, root) = tempdir();
        fs::write(root.join("in.txt"), "v1").unwrap();
        let node = node();
        produce(&root, &node);

        fs::write(root.join("in.txt"), "v2").unwrap();
        let fp = fingerprint(&node, &root).unwrap();
        assert_eq!(
            staleness(&node, &root, CachePolicy::Content, fp).as_deref(),
            Some("inputs changed")
        );
    }

    #[test]
    fn test_output_tampering_is_detected() {
        let (_dir, root) = tempdir();
        fs::write(root.join("in.txt"), "v1").unwrap();
        let node = node();
        let fp = produce(&root, &node);

        fs::write(root.join("out/A.cbor"), "edited").unwrap();
        assert!(staleness(&node, &root, CachePolicy::Content, fp).is_some());
    }

    #[test]
    fn test_params_change_fingerprint() {
        let (_dir, root) = tempdir();
        fs::write(root.join("in.txt"), "v1").unwrap();
        let mut node = node();
        let before = fingerprint(&node, &root).unwrap();
        node.params.insert("min_genes".into(), "200".into());
        assert_ne!(before, fingerprint(&node, &root).unwrap());
    }

    #[test]
    fn test_directory_input() {
        let (_dir, root) = tempdir();
        fs::create_dir_all(root.join("in.txt/sub")).unwrap();
        fs::write(root.join("in.txt/sub/a"), "1").unwrap();
        let node = node();

        let before = fingerprint(&node, &root).unwrap();
        fs::write(root.join("in.txt/sub/a"), "2").unwrap();
        assert_ne!(before, fingerprint(&node, &root).unwrap());
    }

    #[test]
    fn test_invalidate_removes_products() {
        let (_dir, root) = tempdir();
        fs::write(root.join("in.txt"), "v1").unwrap();
        let node = node();
        produce(&root, &node);

        invalidate(&node, &root).unwrap();
        assert!(!root.join("out/A.cbor").exists());
        assert!(!root.join("out/A.cbor.done").exists());

        // nothing left to remove
        invalidate(&node, &root).unwrap();
    }

    #[test]
    fn test_marker_is_json() {
        let (_dir, root) = tempdir();
        fs::write(root.join("in.txt"), "v1").unwrap();
        let node = node();
        let fp = produce(&root, &node);

        let record = read_record(&root.join("out/A.cbor.done")).unwrap();
        assert_eq!(record.task, "qc[sample=A]");
        assert_eq!(record.fingerprint, fp);
        assert!(record.outputs.contains_key(Utf8Path::new("out/A.cbor")));
    }
}
