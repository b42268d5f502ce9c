use std::fmt::Write as _;
use std::path::Path;

use crate::error::{MapperError, Result};
use crate::report::CellAssignment;

/// Write the flat CSV view of a mapping run: two comment lines naming
/// the companion JSON file and the taxonomy hierarchy, then one row
/// per cell with an assignment and confidence column per level.
pub fn write_mapping_csv(
    path: &Path,
    results: &[CellAssignment],
    hierarchy: &[String],
    json_basename: &str,
) -> Result<()> {
    let mut out = String::new();
    writeln!(out, "# metadata = {json_basename}").expect("string write");
    writeln!(
        out,
        "# taxonomy hierarchy = {}",
        serde_json::to_string(hierarchy)?
    )
    .expect("string write");

    out.push_str("cell_id");
    for level in hierarchy {
        write!(out, ",{level},{level}_confidence").expect("string write");
    }
    out.push('\n');

    for cell in results {
        out.push_str(&cell.cell_id);
        for level in hierarchy {
            let assignment = cell.levels.get(level).ok_or_else(|| {
                MapperError::InconsistentInputs(format!(
                    "cell {} has no assignment at level {level}",
                    cell.cell_id
                ))
            })?;
            write!(
                out,
                ",{},{:.4}",
                assignment.assignment, assignment.bootstrapping_probability
            )
            .expect("string write");
        }
        out.push('\n');
    }
    std::fs::write(path, out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::report::LevelAssignment;

    fn cell(id: &str, entries: &[(&str, &str, f64)]) -> CellAssignment {
        let mut levels = BTreeMap::new();
        for (level, node, probability) in entries {
            levels.insert(
                level.to_string(),
                LevelAssignment {
                    assignment: node.to_string(),
                    bootstrapping_probability: *probability,
                    avg_correlation: 0.5,
                },
            );
        }
        CellAssignment {
            cell_id: id.to_string(),
            levels,
        }
    }

    #[test]
    fn test_csv_layout() {
        let hierarchy = vec!["class".to_string(), "cluster".to_string()];
        let results = vec![
            cell("cell_0", &[("class", "A", 1.0), ("cluster", "c0", 0.72)]),
            cell("cell_1", &[("class", "B", 0.9), ("cluster", "c3", 0.6111)]),
        ];
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mapping.csv");
        write_mapping_csv(&path, &results, &hierarchy, "mapping.json").unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[0], "# metadata = mapping.json");
        assert_eq!(lines[1], r#"# taxonomy hierarchy = ["class","cluster"]"#);
        assert_eq!(
            lines[2],
            "cell_id,class,class_confidence,cluster,cluster_confidence"
        );
        assert_eq!(lines[3], "cell_0,A,1.0000,c0,0.7200");
        assert_eq!(lines[4], "cell_1,B,0.9000,c3,0.6111");
    }

    #[test]
    fn test_missing_level_is_an_error() {
        let hierarchy = vec!["class".to_string(), "cluster".to_string()];
        let results = vec![cell("cell_0", &[("class", "A", 1.0)])];
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mapping.csv");
        let err = write_mapping_csv(&path, &results, &hierarchy, "mapping.json").unwrap_err();
        assert!(matches!(err, MapperError::InconsistentInputs(_)));
    }
}
