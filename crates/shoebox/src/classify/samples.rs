//! Per-folder samples of direct children, fed to the rules survey and the
//! AI payloads.

use serde_json::json;
use shoebox_catalog::{basename, FileRecord, FolderRecord};
use std::collections::BTreeMap;

/// One direct child of a folder.
#[derive(Debug, Clone)]
pub struct ChildInfo {
    pub name: String,
    pub is_dir: bool,
    /// MIME for files, "*" for directories
    pub mime: String,
    pub size: u64,
    /// Files anywhere inside, for directories
    pub file_count: u64,
}

impl ChildInfo {
    pub fn file(name: &str, mime: &str, size: u64) -> Self {
        Self {
            name: name.to_string(),
            is_dir: false,
            mime: mime.to_string(),
            size,
            file_count: 1,
        }
    }

    pub fn dir(name: &str, file_count: u64) -> Self {
        Self {
            name: name.to_string(),
            is_dir: true,
            mime: "*".to_string(),
            size: 0,
            file_count,
        }
    }
}

/// Direct children of one folder, like `ls -lh` output.
#[derive(Debug, Clone)]
pub struct FolderSample {
    /// Folder path as used for rule matching (source-relative)
    pub path: String,
    /// Sorted by name
    pub children: Vec<ChildInfo>,
    /// Files anywhere in the subtree
    pub total_files: u64,
}

impl FolderSample {
    pub fn name(&self) -> &str {
        basename(&self.path)
    }

    /// JSON payload for the AI folder-action prompt.
    pub fn payload_json(&self, limit: usize) -> serde_json::Value {
        let children: Vec<serde_json::Value> = self
            .children
            .iter()
            .take(limit)
            .map(|child| {
                if child.is_dir {
                    json!({
                        "name": child.name,
                        "type": "dir",
                        "files_inside": child.file_count,
                    })
                } else {
                    json!({
                        "name": child.name,
                        "type": "file",
                        "mime": child.mime,
                        "size": child.size,
                    })
                }
            })
            .collect();
        json!({
            "folder_name": self.name(),
            "folder_path": self.path,
            "children": children,
            "total_files": self.total_files,
            "child_count": self.children.len(),
        })
    }
}

/// Build samples for every folder from the catalog records.
///
/// `rel` maps an absolute catalog path to the source-relative form used
/// for rule matching.
pub fn build_samples(
    folders: &[FolderRecord],
    files: &[FileRecord],
    rel: impl Fn(&str) -> String,
) -> BTreeMap<String, FolderSample> {
    let mut samples: BTreeMap<String, FolderSample> = folders
        .iter()
        .map(|folder| {
            (
                folder.path.clone(),
                FolderSample {
                    path: rel(&folder.path),
                    children: Vec::new(),
                    total_files: 0,
                },
            )
        })
        .collect();

    // Direct file children and per-folder direct file counts.
    for file in files {
        let parent = shoebox_catalog::parent_path(&file.path);
        if let Some(sample) = samples.get_mut(parent) {
            sample.children.push(ChildInfo::file(
                basename(&file.path),
                file.mime.as_deref().unwrap_or("*"),
                file.size,
            ));
            sample.total_files += 1;
        }
    }

    // Recursive file totals, deepest first.
    let mut children_of: BTreeMap<&str, Vec<&FolderRecord>> = BTreeMap::new();
    for folder in folders {
        if let Some(parent) = &folder.parent_path {
            children_of.entry(parent.as_str()).or_default().push(folder);
        }
    }
    let mut order: Vec<&FolderRecord> = folders.iter().collect();
    order.sort_by(|a, b| b.depth.cmp(&a.depth).then_with(|| a.path.cmp(&b.path)));
    let mut totals: BTreeMap<String, u64> = BTreeMap::new();
    for folder in &order {
        let direct = samples.get(&folder.path).map(|s| s.total_files).unwrap_or(0);
        let from_children: u64 = children_of
            .get(folder.path.as_str())
            .into_iter()
            .flatten()
            .map(|f| totals.get(&f.path).copied().unwrap_or(0))
            .sum();
        totals.insert(folder.path.clone(), direct + from_children);
    }

    // Subfolder children with their recursive counts.
    for folder in folders {
        let Some(parent) = &folder.parent_path else {
            continue;
        };
        let count = totals.get(&folder.path).copied().unwrap_or(0);
        if let Some(sample) = samples.get_mut(parent) {
            sample.children.push(ChildInfo::dir(folder.name(), count));
        }
    }

    for (path, sample) in samples.iter_mut() {
        sample.children.sort_by(|a, b| a.name.cmp(&b.name));
        sample.total_files = totals.get(path).copied().unwrap_or(sample.total_files);
    }
    samples
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoebox_catalog::{FileRecord, FolderRecord};

    #[test]
    fn samples_collect_direct_children_and_recursive_totals() {
        let folders = vec![
            FolderRecord::new("/src"),
            FolderRecord::new("/src/Downloads"),
            FolderRecord::new("/src/Downloads/old"),
        ];
        let mut pdf = FileRecord::new("/src/Downloads/invoice.pdf", 10, 0);
        pdf.mime = Some("application/pdf".into());
        let mp3 = FileRecord::new("/src/Downloads/old/song.mp3", 20, 0);
        let files = vec![pdf, mp3];

        let samples = build_samples(&folders, &files, |p| p.to_string());

        let downloads = &samples["/src/Downloads"];
        assert_eq!(downloads.children.len(), 2);
        assert_eq!(downloads.total_files, 2);
        let dir_child = downloads.children.iter().find(|c| c.is_dir).unwrap();
        assert_eq!(dir_child.name, "old");
        assert_eq!(dir_child.file_count, 1);

        let src = &samples["/src"];
        assert_eq!(src.total_files, 2);
        assert_eq!(src.children.len(), 1);
    }
}
