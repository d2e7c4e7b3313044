//! Filesystem operations exposed over the RPC surface: read/write/edit/list.
//!
//! Every operation returns its concrete `*Outcome` directly (never `Err`) —
//! failures like "file not found" are operation-level results (`success:
//! false`), not dispatch-loop errors. This matches the wire contract: only
//! malformed requests or auth failures become `type: "error"` envelopes.

use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use fleet_proto::{DirEntry, EditFileOutcome, ListDirOutcome, ReadBytesOutcome, ReadFileOutcome, WriteFileOutcome};
use similar::TextDiff;

const FUZZY_THRESHOLD: f32 = 0.5;

pub async fn read_file(path: &str) -> ReadFileOutcome {
    match tokio::fs::metadata(path).await {
        Ok(meta) if !meta.is_file() => {
            return ReadFileOutcome {
                success: false,
                content: None,
                error: Some(format!("Not a file: {path}")),
            }
        }
        Err(_) => {
            return ReadFileOutcome {
                success: false,
                content: None,
                error: Some(format!("File not found: {path}")),
            }
        }
        Ok(_) => {}
    }

    match tokio::fs::read_to_string(path).await {
        Ok(content) => ReadFileOutcome {
            success: true,
            content: Some(content),
            error: None,
        },
        Err(e) => ReadFileOutcome {
            success: false,
            content: None,
            error: Some(format!("Failed to read {path}: {e}")),
        },
    }
}

pub async fn read_bytes(path: &str) -> ReadBytesOutcome {
    match tokio::fs::metadata(path).await {
        Ok(meta) if !meta.is_file() => {
            return ReadBytesOutcome {
                success: false,
                content_b64: None,
                size: None,
                path: Some(path.to_string()),
                error: Some(format!("Not a file: {path}")),
            }
        }
        Err(_) => {
            return ReadBytesOutcome {
                success: false,
                content_b64: None,
                size: None,
                path: Some(path.to_string()),
                error: Some(format!("File not found: {path}")),
            }
        }
        Ok(_) => {}
    }

    match tokio::fs::read(path).await {
        Ok(bytes) => ReadBytesOutcome {
            success: true,
            size: Some(bytes.len()),
            content_b64: Some(BASE64.encode(&bytes)),
            path: Some(path.to_string()),
            error: None,
        },
        Err(e) => ReadBytesOutcome {
            success: false,
            content_b64: None,
            size: None,
            path: Some(path.to_string()),
            error: Some(format!("Failed to read {path}: {e}")),
        },
    }
}

pub async fn write_file(path: &str, content: &str) -> WriteFileOutcome {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return WriteFileOutcome {
                    success: false,
                    bytes: None,
                    path: Some(path.to_string()),
                    error: Some(format!("Failed to create parent directory for {path}: {e}")),
                };
            }
        }
    }

    match tokio::fs::write(path, content).await {
        Ok(()) => WriteFileOutcome {
            success: true,
            bytes: Some(content.len()),
            path: Some(path.to_string()),
            error: None,
        },
        Err(e) => WriteFileOutcome {
            success: false,
            bytes: None,
            path: Some(path.to_string()),
            error: Some(format!("Failed to write {path}: {e}")),
        },
    }
}

pub async fn edit_file(path: &str, old_text: &str, new_text: &str) -> EditFileOutcome {
    match tokio::fs::metadata(path).await {
        Ok(meta) if !meta.is_file() => {
            return EditFileOutcome {
                success: false,
                path: Some(path.to_string()),
                error: Some(format!("Not a file: {path}")),
            }
        }
        Err(_) => {
            return EditFileOutcome {
                success: false,
                path: Some(path.to_string()),
                error: Some(format!("File not found: {path}")),
            }
        }
        Ok(_) => {}
    }

    let content = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) => {
            return EditFileOutcome {
                success: false,
                path: Some(path.to_string()),
                error: Some(format!("Failed to read {path}: {e}")),
            }
        }
    };

    let occurrences = content.matches(old_text).count();
    if occurrences == 1 {
        let updated = content.replacen(old_text, new_text, 1);
        return match tokio::fs::write(path, &updated).await {
            Ok(()) => EditFileOutcome {
                success: true,
                path: Some(path.to_string()),
                error: None,
            },
            Err(e) => EditFileOutcome {
                success: false,
                path: Some(path.to_string()),
                error: Some(format!("Failed to write {path}: {e}")),
            },
        };
    }

    if occurrences > 1 {
        return EditFileOutcome {
            success: false,
            path: Some(path.to_string()),
            error: Some(format!(
                "old_text appears {occurrences} times. Please provide more context."
            )),
        };
    }

    let error = match best_fuzzy_match(&content, old_text) {
        Some((ratio, line_no, diff)) => format!(
            "old_text not found in {path}. Best match ({:.0}%) at line {line_no}:\n{diff}",
            ratio * 100.0
        ),
        None => format!("old_text not found in {path}. No similar text found."),
    };
    EditFileOutcome {
        success: false,
        path: Some(path.to_string()),
        error: Some(error),
    }
}

pub async fn list_dir(path: &str) -> ListDirOutcome {
    let mut reader = match tokio::fs::read_dir(path).await {
        Ok(r) => r,
        Err(_) => {
            return ListDirOutcome {
                success: false,
                entries: None,
                error: Some(format!("Directory not found: {path}")),
            }
        }
    };

    let mut entries = Vec::new();
    loop {
        match reader.next_entry().await {
            Ok(Some(entry)) => {
                let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
                entries.push(DirEntry {
                    name: entry.file_name().to_string_lossy().into_owned(),
                    is_dir,
                });
            }
            Ok(None) => break,
            Err(e) => {
                return ListDirOutcome {
                    success: false,
                    entries: None,
                    error: Some(format!("Failed to list {path}: {e}")),
                }
            }
        }
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));

    ListDirOutcome {
        success: true,
        entries: Some(entries),
        error: None,
    }
}

/// Slides a window the size of `old_text`'s line count across `content`,
/// scoring each position with a SequenceMatcher-style ratio and returning
/// the best match above [`FUZZY_THRESHOLD`], its 1-based starting line, and
/// a unified diff against `old_text`.
fn best_fuzzy_match(content: &str, old_text: &str) -> Option<(f32, usize, String)> {
    let file_lines: Vec<&str> = content.lines().collect();
    let old_line_count = old_text.lines().count().max(1);
    if file_lines.is_empty() || file_lines.len() < old_line_count {
        return None;
    }

    let mut best_ratio = 0.0f32;
    let mut best_start = 0usize;
    for start in 0..=(file_lines.len() - old_line_count) {
        let window = file_lines[start..start + old_line_count].join("\n");
        let ratio = TextDiff::from_lines(&window, old_text).ratio();
        if ratio > best_ratio {
            best_ratio = ratio;
            best_start = start;
        }
    }

    if best_ratio < FUZZY_THRESHOLD {
        return None;
    }

    let window = file_lines[best_start..best_start + old_line_count].join("\n");
    let diff = TextDiff::from_lines(&window, old_text)
        .unified_diff()
        .context_radius(1)
        .header("current", "requested")
        .to_string();

    Some((best_ratio, best_start + 1, diff))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_file_missing_reports_not_found() {
        let outcome = read_file("/nonexistent/path/surely").await;
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("File not found: /nonexistent/path/surely"));
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        let path_str = path.to_str().unwrap();

        let write_outcome = write_file(path_str, "hello world").await;
        assert!(write_outcome.success);
        assert_eq!(write_outcome.bytes, Some(11));

        let read_outcome = read_file(path_str).await;
        assert!(read_outcome.success);
        assert_eq!(read_outcome.content.as_deref(), Some("hello world"));
    }

    #[tokio::test]
    async fn write_file_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deep/file.txt");
        let outcome = write_file(path.to_str().unwrap(), "x").await;
        assert!(outcome.success);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn read_bytes_reports_size_and_base64() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bin.dat");
        tokio::fs::write(&path, [0u8, 1, 2, 255]).await.unwrap();

        let outcome = read_bytes(path.to_str().unwrap()).await;
        assert!(outcome.success);
        assert_eq!(outcome.size, Some(4));
        let decoded = BASE64.decode(outcome.content_b64.unwrap()).unwrap();
        assert_eq!(decoded, vec![0, 1, 2, 255]);
    }

    #[tokio::test]
    async fn edit_file_replaces_unique_occurrence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        tokio::fs::write(&path, "fn main() {\n    println!(\"hi\");\n}\n").await.unwrap();

        let outcome = edit_file(
            path.to_str().unwrap(),
            "println!(\"hi\");",
            "println!(\"bye\");",
        )
        .await;
        assert!(outcome.success);
        let updated = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(updated.contains("bye"));
    }

    #[tokio::test]
    async fn edit_file_ambiguous_occurrence_reports_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        tokio::fs::write(&path, "x\nx\nx\n").await.unwrap();

        let outcome = edit_file(path.to_str().unwrap(), "x", "y").await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("appears 3 times"));
    }

    #[tokio::test]
    async fn edit_file_missing_anchor_reports_no_similar_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        tokio::fs::write(&path, "completely unrelated content here\n").await.unwrap();

        let outcome = edit_file(path.to_str().unwrap(), "totally different text block", "y").await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("old_text not found"));
    }

    #[tokio::test]
    async fn edit_file_close_anchor_suggests_best_match() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        tokio::fs::write(&path, "def greet(name):\n    print(\"hello\", name)\n").await.unwrap();

        let outcome = edit_file(
            path.to_str().unwrap(),
            "def greet(nam):\n    print(\"hello\", nam)\n",
            "def greet(n):\n    print(\"hi\", n)\n",
        )
        .await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("Best match"));
    }

    #[tokio::test]
    async fn list_dir_reports_entries_sorted_with_kind() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir(dir.path().join("sub")).await.unwrap();
        tokio::fs::write(dir.path().join("file.txt"), "x").await.unwrap();

        let outcome = list_dir(dir.path().to_str().unwrap()).await;
        assert!(outcome.success);
        let entries = outcome.entries.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "file.txt");
        assert!(!entries[0].is_dir);
        assert_eq!(entries[1].name, "sub");
        assert!(entries[1].is_dir);
    }

    #[tokio::test]
    async fn list_dir_missing_reports_not_found() {
        let outcome = list_dir("/nonexistent/dir/surely").await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("Directory not found"));
    }
}
