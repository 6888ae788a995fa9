//! Three-way merge previews.
//!
//! Uses the `diffy` crate to perform line-based three-way merges between a
//! base, "ours" (local) and "theirs" (remote) version of a file, so a
//! resolution UI can show either a clean merge or one with conflict markers.

use tracing::{debug, info};

use crate::conflict::reconcile::ConflictedFile;

/// The result of a three-way merge attempt.
#[derive(Debug, Clone)]
pub struct MergeResult {
    /// The merged content (contains conflict markers if `has_conflicts` is true).
    pub merged_content: String,
    /// Whether the merge needs a human decision.
    pub has_conflicts: bool,
    /// Locations of conflict marker blocks within the merged content.
    pub conflict_markers: Vec<ConflictMarker>,
}

impl MergeResult {
    fn clean(content: &str) -> Self {
        Self {
            merged_content: content.to_string(),
            has_conflicts: false,
            conflict_markers: Vec::new(),
        }
    }
}

/// A single conflict region within merged output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictMarker {
    /// Line (1-indexed) of the `<<<<<<<` marker.
    pub start_line: usize,
    /// Line (1-indexed) of the `>>>>>>>` marker.
    pub end_line: usize,
}

/// Stateless three-way merge engine.
pub struct Merger;

impl Merger {
    /// Attempt a three-way merge of `base`, `ours`, and `theirs`.
    ///
    /// Always returns merged content. On conflict, standard `<<<<<<<` /
    /// `=======` / `>>>>>>>` markers are inserted and `has_conflicts` is set.
    pub fn three_way_merge(base: &str, ours: &str, theirs: &str) -> MergeResult {
        if ours == base {
            debug!("ours == base, theirs wins cleanly");
            return MergeResult::clean(theirs);
        }
        if theirs == base || ours == theirs {
            debug!("theirs == base or identical changes, ours wins cleanly");
            return MergeResult::clean(ours);
        }

        match diffy::merge(base, ours, theirs) {
            Ok(merged) => {
                debug!("clean line-level merge");
                MergeResult::clean(&merged)
            }
            Err(conflicted) => {
                let conflict_markers = find_markers(&conflicted);
                debug!(regions = conflict_markers.len(), "merge has conflicts");
                MergeResult {
                    merged_content: conflicted,
                    has_conflicts: true,
                    conflict_markers,
                }
            }
        }
    }

    /// Preview the merge of a reconciled conflict.
    ///
    /// A delete-versus-modify conflict previews the surviving side and is
    /// always flagged as needing a decision.
    pub fn preview(conflict: &ConflictedFile) -> MergeResult {
        info!(path = %conflict.path, class = %conflict.classification, "previewing merge");
        if conflict.ours_deleted() || conflict.theirs_deleted() {
            let surviving = if conflict.ours_deleted() {
                &conflict.theirs_content
            } else {
                &conflict.ours_content
            };
            return MergeResult {
                merged_content: surviving.clone(),
                has_conflicts: true,
                conflict_markers: Vec::new(),
            };
        }
        Self::three_way_merge(
            &conflict.base_content,
            &conflict.ours_content,
            &conflict.theirs_content,
        )
    }

    /// Quick check: can these three versions be merged without a decision?
    pub fn can_auto_merge(base: &str, ours: &str, theirs: &str) -> bool {
        !Self::three_way_merge(base, ours, theirs).has_conflicts
    }
}

fn find_markers(content: &str) -> Vec<ConflictMarker> {
    let mut markers = Vec::new();
    let mut start = None;
    for (idx, line) in content.lines().enumerate() {
        if line.starts_with("<<<<<<<") {
            start = Some(idx + 1);
        } else if line.starts_with(">>>>>>>") {
            if let Some(start_line) = start.take() {
                markers.push(ConflictMarker {
                    start_line,
                    end_line: idx + 1,
                });
            }
        }
    }
    markers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::reconcile::ChangeClass;

    fn conflict(class: ChangeClass, ours: &str, theirs: &str, base: &str) -> ConflictedFile {
        ConflictedFile {
            path: "a.txt".into(),
            ours_content: ours.into(),
            theirs_content: theirs.into(),
            base_content: base.into(),
            is_new: false,
            is_deleted: matches!(
                class,
                ChangeClass::DeletedLocally | ChangeClass::DeletedRemotely
            ),
            classification: class,
        }
    }

    #[test]
    fn test_identical_files() {
        let base = "line1\nline2\nline3\n";
        let result = Merger::three_way_merge(base, base, base);
        assert!(!result.has_conflicts);
        assert!(result.conflict_markers.is_empty());
    }

    #[test]
    fn test_only_one_side_changed() {
        let base = "line1\nline2\nline3\n";
        let changed = "line1\nmodified\nline3\n";
        assert_eq!(
            Merger::three_way_merge(base, changed, base).merged_content,
            changed
        );
        assert_eq!(
            Merger::three_way_merge(base, base, changed).merged_content,
            changed
        );
    }

    #[test]
    fn test_non_overlapping_changes() {
        let base = "line1\nline2\nline3\nline4\nline5\nline6\nline7\nline8\n";
        let ours = "LINE1\nline2\nline3\nline4\nline5\nline6\nline7\nline8\n";
        let theirs = "line1\nline2\nline3\nline4\nline5\nline6\nline7\nLINE8\n";
        let result = Merger::three_way_merge(base, ours, theirs);
        assert!(!result.has_conflicts);
        assert!(result.merged_content.contains("LINE1"));
        assert!(result.merged_content.contains("LINE8"));
    }

    #[test]
    fn test_conflicting_changes() {
        let base = "line1\noriginal\nline3\n";
        let ours = "line1\nours_version\nline3\n";
        let theirs = "line1\ntheirs_version\nline3\n";
        let result = Merger::three_way_merge(base, ours, theirs);
        assert!(result.has_conflicts);
        assert!(result.merged_content.contains("<<<<<<<"));
        assert!(result.merged_content.contains("======="));
        assert!(result.merged_content.contains(">>>>>>>"));
        assert_eq!(result.conflict_markers.len(), 1);
        assert!(result.conflict_markers[0].start_line < result.conflict_markers[0].end_line);
    }

    #[test]
    fn test_can_auto_merge() {
        let base = "aaa\nbbb\nccc\n";
        assert!(Merger::can_auto_merge(base, base, base));
        assert!(Merger::can_auto_merge(base, "XXX\nbbb\nccc\n", "XXX\nbbb\nccc\n"));
        assert!(!Merger::can_auto_merge(
            "line1\noriginal\nline3\n",
            "line1\nours\nline3\n",
            "line1\ntheirs\nline3\n"
        ));
    }

    #[test]
    fn test_preview_modified_conflict() {
        let c = conflict(
            ChangeClass::ModifiedPotentialConflict,
            "ours\n",
            "theirs\n",
            "base\n",
        );
        let result = Merger::preview(&c);
        assert!(result.has_conflicts);
        assert!(result.merged_content.contains("ours"));
        assert!(result.merged_content.contains("theirs"));
    }

    #[test]
    fn test_preview_delete_versus_modify() {
        let c = conflict(ChangeClass::DeletedLocally, "", "edited\n", "original\n");
        let result = Merger::preview(&c);
        assert!(result.has_conflicts);
        assert_eq!(result.merged_content, "edited\n");
    }

    #[test]
    fn test_find_markers() {
        let text = "a\n<<<<<<< ours\nx\n=======\ny\n>>>>>>> theirs\nb\n";
        assert_eq!(
            find_markers(text),
            vec![ConflictMarker {
                start_line: 2,
                end_line: 6
            }]
        );
    }
}
