//! JSON scheme files, optionally carrying a static group assignment.
//!
//! Format: an array of `{"level": [..], "coeff": x, "group": n}` entries.
//! The `group` field is all-or-none: if any entry carries it, every entry
//! must, and assignment numbering has to start at group 0.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::combi_error::CombiError;
use crate::scheme::{CombiScheme, LevelType};

#[derive(Clone, Debug, Serialize, Deserialize)]
struct SchemeFileEntry {
    level: Vec<LevelType>,
    coeff: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    group: Option<usize>,
}

/// A scheme loaded from disk, with the per-task group assignment when the
/// file uses static task placement.
#[derive(Clone, Debug)]
pub struct SchemeFromFile {
    pub scheme: CombiScheme,
    /// `Some` iff the file assigns every task to a process group.
    pub group_assignment: Option<Vec<usize>>,
}

impl SchemeFromFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CombiError> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, CombiError> {
        let entries: Vec<SchemeFileEntry> = serde_json::from_str(text)?;
        if entries.is_empty() {
            return Err(CombiError::InvalidScheme("scheme file is empty".into()));
        }

        let with_group = entries.iter().filter(|e| e.group.is_some()).count();
        if with_group != 0 && with_group != entries.len() {
            return Err(CombiError::InvalidScheme(format!(
                "group assignment must be all-or-none ({} of {} entries have one)",
                with_group,
                entries.len()
            )));
        }

        let levels = entries.iter().map(|e| e.level.clone()).collect();
        let coeffs = entries.iter().map(|e| e.coeff).collect();
        let scheme = CombiScheme::from_parts(levels, coeffs)?;

        let group_assignment = if with_group == entries.len() {
            let groups: Vec<usize> = entries.iter().map(|e| e.group.unwrap()).collect();
            if !groups.contains(&0) {
                return Err(CombiError::InvalidScheme(
                    "static group assignment must start at group 0".into(),
                ));
            }
            Some(groups)
        } else {
            None
        };

        Ok(Self {
            scheme,
            group_assignment,
        })
    }
}

/// Write a scheme (with optional group assignment) in the file format.
pub fn write_scheme_file(
    path: impl AsRef<Path>,
    scheme: &CombiScheme,
    groups: Option<&[usize]>,
) -> Result<(), CombiError> {
    if let Some(gs) = groups {
        if gs.len() != scheme.len() {
            return Err(CombiError::InvalidScheme(format!(
                "{} group tags for {} grids",
                gs.len(),
                scheme.len()
            )));
        }
    }
    let entries: Vec<SchemeFileEntry> = scheme
        .levels()
        .iter()
        .zip(scheme.coeffs())
        .enumerate()
        .map(|(i, (level, &coeff))| SchemeFileEntry {
            level: level.clone(),
            coeff,
            group: groups.map(|gs| gs[i]),
        })
        .collect();
    fs::write(path, serde_json::to_vec_pretty(&entries)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_dynamic_scheme() {
        let text = r#"[
            {"level": [2, 1], "coeff": 1.0},
            {"level": [1, 2], "coeff": 1.0},
            {"level": [1, 1], "coeff": -1.0}
        ]"#;
        let loaded = SchemeFromFile::parse(text).unwrap();
        assert_eq!(loaded.scheme.len(), 3);
        assert!(loaded.group_assignment.is_none());
    }

    #[test]
    fn parse_static_scheme() {
        let text = r#"[
            {"level": [2, 1], "coeff": 1.0, "group": 0},
            {"level": [1, 2], "coeff": 1.0, "group": 1},
            {"level": [1, 1], "coeff": -1.0, "group": 0}
        ]"#;
        let loaded = SchemeFromFile::parse(text).unwrap();
        assert_eq!(loaded.group_assignment, Some(vec![0, 1, 0]));
    }

    #[test]
    fn mixed_group_tags_are_rejected() {
        let text = r#"[
            {"level": [2, 1], "coeff": 1.0, "group": 0},
            {"level": [1, 2], "coeff": 1.0}
        ]"#;
        assert!(SchemeFromFile::parse(text).is_err());
    }

    #[test]
    fn groups_must_start_at_zero() {
        let text = r#"[
            {"level": [2, 1], "coeff": 1.0, "group": 1},
            {"level": [1, 2], "coeff": 1.0, "group": 2}
        ]"#;
        assert!(SchemeFromFile::parse(text).is_err());
    }

    #[test]
    fn empty_file_is_rejected() {
        assert!(SchemeFromFile::parse("[]").is_err());
    }
}
