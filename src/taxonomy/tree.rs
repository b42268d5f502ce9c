use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use serde_json::{Map, Value, json};

use crate::error::{MapperError, Result};

/// Identifies a parent node in the taxonomy. `None` is the virtual root
/// above the first level.
pub type ParentNode = Option<(String, String)>;

/// A labeled rooted tree of cell types. Levels are ordered from coarsest
/// to finest; nodes at the leaf level own the reference row indices of
/// their member cells, nodes at every other level own the names of their
/// children at the next level.
#[derive(Debug, Clone, PartialEq)]
pub struct TaxonomyTree {
    hierarchy: Vec<String>,
    children: HashMap<String, BTreeMap<String, Vec<String>>>,
    leaf_rows: BTreeMap<String, Vec<usize>>,
}

impl TaxonomyTree {
    /// Build a tree from its JSON encoding:
    /// `{"hierarchy": [...], "<level>": {"<node>": [children-or-rows]}}`.
    pub fn from_json_value(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| MapperError::InvalidTaxonomy("tree is not a JSON object".into()))?;
        let hierarchy: Vec<String> = obj
            .get("hierarchy")
            .and_then(|h| h.as_array())
            .ok_or_else(|| MapperError::InvalidTaxonomy("missing hierarchy list".into()))?
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| MapperError::InvalidTaxonomy("non-string level name".into()))
            })
            .collect::<Result<_>>()?;
        if hierarchy.is_empty() {
            return Err(MapperError::InvalidTaxonomy("hierarchy is empty".into()));
        }

        let mut children = HashMap::new();
        let leaf_level = &hierarchy[hierarchy.len() - 1];
        for level in &hierarchy[..hierarchy.len() - 1] {
            let nodes = level_map(obj, level)?;
            let mut level_children = BTreeMap::new();
            for (node, kids) in nodes {
                let kids: Vec<String> = kids
                    .as_array()
                    .ok_or_else(|| {
                        MapperError::InvalidTaxonomy(format!("children of {node} are not a list"))
                    })?
                    .iter()
                    .map(|v| {
                        v.as_str().map(str::to_string).ok_or_else(|| {
                            MapperError::InvalidTaxonomy(format!(
                                "non-string child under {level}/{node}"
                            ))
                        })
                    })
                    .collect::<Result<_>>()?;
                level_children.insert(node.clone(), kids);
            }
            children.insert(level.clone(), level_children);
        }

        let mut leaf_rows = BTreeMap::new();
        for (leaf, rows) in level_map(obj, leaf_level)? {
            let rows: Vec<usize> = rows
                .as_array()
                .ok_or_else(|| {
                    MapperError::InvalidTaxonomy(format!("rows of leaf {leaf} are not a list"))
                })?
                .iter()
                .map(|v| {
                    v.as_u64().map(|r| r as usize).ok_or_else(|| {
                        MapperError::InvalidTaxonomy(format!("non-integer row in leaf {leaf}"))
                    })
                })
                .collect::<Result<_>>()?;
            leaf_rows.insert(leaf.clone(), rows);
        }

        let tree = Self {
            hierarchy,
            children,
            leaf_rows,
        };
        tree.validate()?;
        Ok(tree)
    }

    pub fn from_str(serialized: &str) -> Result<Self> {
        Self::from_json_value(&serde_json::from_str(serialized)?)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(MapperError::MissingInput(path.to_path_buf()));
        }
        Self::from_str(&std::fs::read_to_string(path)?)
    }

    /// Serialize back to the JSON encoding `from_json_value` accepts.
    pub fn to_json_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("hierarchy".into(), json!(self.hierarchy));
        for level in &self.hierarchy[..self.hierarchy.len() - 1] {
            obj.insert(level.clone(), json!(self.children[level]));
        }
        obj.insert(self.leaf_level().to_string(), json!(self.leaf_rows));
        Value::Object(obj)
    }

    pub fn to_str(&self) -> String {
        self.to_json_value().to_string()
    }

    fn validate(&self) -> Result<()> {
        let n_levels = self.hierarchy.len();
        for (idx, level) in self.hierarchy[..n_levels - 1].iter().enumerate() {
            let nodes = self.children.get(level).ok_or_else(|| {
                MapperError::InvalidTaxonomy(format!("level {level} missing from tree"))
            })?;
            if nodes.is_empty() {
                return Err(MapperError::InvalidTaxonomy(format!(
                    "level {level} has no nodes"
                )));
            }
            let next_level = &self.hierarchy[idx + 1];
            let mut seen: HashSet<&str> = HashSet::new();
            for (node, kids) in nodes {
                for kid in kids {
                    if !self.node_exists(next_level, kid) {
                        return Err(MapperError::InvalidTaxonomy(format!(
                            "{level}/{node} names child {kid} absent from level {next_level}"
                        )));
                    }
                    if !seen.insert(kid.as_str()) {
                        return Err(MapperError::InvalidTaxonomy(format!(
                            "node {kid} at level {next_level} has more than one parent"
                        )));
                    }
                }
            }
            let n_next = if idx + 2 == n_levels {
                self.leaf_rows.len()
            } else {
                self.children[next_level].len()
            };
            if seen.len() != n_next {
                return Err(MapperError::InvalidTaxonomy(format!(
                    "level {next_level} has {n_next} nodes but {} are claimed as children",
                    seen.len()
                )));
            }
        }

        if self.leaf_rows.is_empty() {
            return Err(MapperError::InvalidTaxonomy("no leaf nodes".into()));
        }
        let mut seen_rows = HashSet::new();
        for (leaf, rows) in &self.leaf_rows {
            if rows.is_empty() {
                return Err(MapperError::InvalidTaxonomy(format!(
                    "leaf {leaf} owns no reference rows"
                )));
            }
            for row in rows {
                if !seen_rows.insert(*row) {
                    return Err(MapperError::InvalidTaxonomy(format!(
                        "reference row {row} appears in more than one leaf"
                    )));
                }
            }
        }
        Ok(())
    }

    fn node_exists(&self, level: &str, node: &str) -> bool {
        if level == self.leaf_level() {
            self.leaf_rows.contains_key(node)
        } else {
            self.children
                .get(level)
                .is_some_and(|m| m.contains_key(node))
        }
    }

    pub fn hierarchy(&self) -> &[String] {
        &self.hierarchy
    }

    pub fn leaf_level(&self) -> &str {
        &self.hierarchy[self.hierarchy.len() - 1]
    }

    /// Node names at a level, sorted.
    pub fn nodes_at_level(&self, level: &str) -> Result<Vec<String>> {
        if level == self.leaf_level() {
            return Ok(self.leaf_rows.keys().cloned().collect());
        }
        self.children
            .get(level)
            .map(|m| m.keys().cloned().collect())
            .ok_or_else(|| MapperError::InvalidTaxonomy(format!("{level} is not a valid level")))
    }

    /// Immediate children of a parent; the virtual root's children are
    /// the nodes of the first level. Sorted.
    pub fn children_of(&self, parent: &ParentNode) -> Result<Vec<String>> {
        match parent {
            None => self.nodes_at_level(&self.hierarchy[0]),
            Some((level, node)) => {
                if level == self.leaf_level() {
                    return Err(MapperError::InvalidTaxonomy(format!(
                        "leaf node {node} has no children"
                    )));
                }
                let mut kids = self
                    .children
                    .get(level.as_str())
                    .and_then(|m| m.get(node.as_str()))
                    .cloned()
                    .ok_or_else(|| {
                        MapperError::InvalidTaxonomy(format!(
                            "{node} is not a valid node at level {level}"
                        ))
                    })?;
                kids.sort();
                Ok(kids)
            }
        }
    }

    pub fn all_leaves(&self) -> Vec<String> {
        self.leaf_rows.keys().cloned().collect()
    }

    pub fn n_leaves(&self) -> usize {
        self.leaf_rows.len()
    }

    pub fn leaf_to_rows(&self) -> &BTreeMap<String, Vec<usize>> {
        &self.leaf_rows
    }

    pub fn rows_for_leaf(&self, leaf: &str) -> Result<&[usize]> {
        self.leaf_rows
            .get(leaf)
            .map(Vec::as_slice)
            .ok_or_else(|| MapperError::InvalidTaxonomy(format!("{leaf} is not a valid leaf")))
    }

    /// `level -> node -> descendant leaves` for every level.
    pub fn as_leaves(&self) -> BTreeMap<String, BTreeMap<String, Vec<String>>> {
        let mut result = BTreeMap::new();
        let leaf_level = self.leaf_level().to_string();
        result.insert(
            leaf_level.clone(),
            self.leaf_rows
                .keys()
                .map(|leaf| (leaf.clone(), vec![leaf.clone()]))
                .collect::<BTreeMap<_, _>>(),
        );
        for level in self.hierarchy[..self.hierarchy.len() - 1].iter().rev() {
            let mut level_map = BTreeMap::new();
            for node in self.children[level].keys() {
                let mut leaves = Vec::new();
                self.collect_leaves(level, node, &mut leaves);
                leaves.sort();
                level_map.insert(node.clone(), leaves);
            }
            result.insert(level.clone(), level_map);
        }
        result
    }

    fn collect_leaves(&self, level: &str, node: &str, out: &mut Vec<String>) {
        if level == self.leaf_level() {
            out.push(node.to_string());
            return;
        }
        let next = {
            let idx = self.hierarchy.iter().position(|l| l == level).unwrap_or(0);
            &self.hierarchy[idx + 1]
        };
        if let Some(kids) = self.children.get(level).and_then(|m| m.get(node)) {
            for kid in kids {
                self.collect_leaves(next, kid, out);
            }
        }
    }

    /// All valid parents: the virtual root plus every non-leaf node,
    /// in hierarchy order.
    pub fn all_parents(&self) -> Vec<ParentNode> {
        let mut parents: Vec<ParentNode> = vec![None];
        for level in &self.hierarchy[..self.hierarchy.len() - 1] {
            for node in self.children[level].keys() {
                parents.push(Some((level.clone(), node.clone())));
            }
        }
        parents
    }

    /// Leaf pairs that must be discriminated under `parent`: all
    /// `(a, b)` with `a < b` where `a` and `b` descend from different
    /// immediate children of `parent`.
    pub fn leaves_to_compare(&self, parent: &ParentNode) -> Result<Vec<(String, String)>> {
        let child_level = match parent {
            None => self.hierarchy[0].clone(),
            Some((level, _)) => {
                let idx = self
                    .hierarchy
                    .iter()
                    .position(|l| l == level)
                    .ok_or_else(|| {
                        MapperError::InvalidTaxonomy(format!("{level} is not a valid level"))
                    })?;
                if idx + 1 >= self.hierarchy.len() {
                    return Err(MapperError::InvalidTaxonomy(format!(
                        "{level} has no child level"
                    )));
                }
                self.hierarchy[idx + 1].clone()
            }
        };
        let as_leaves = self.as_leaves();
        let children = self.children_of(parent)?;
        let leaf_sets: Vec<&Vec<String>> = children
            .iter()
            .map(|c| &as_leaves[&child_level][c])
            .collect();

        let mut pairs = Vec::new();
        for i in 0..leaf_sets.len() {
            for j in (i + 1)..leaf_sets.len() {
                for a in leaf_sets[i] {
                    for b in leaf_sets[j] {
                        if a < b {
                            pairs.push((a.clone(), b.clone()));
                        } else {
                            pairs.push((b.clone(), a.clone()));
                        }
                    }
                }
            }
        }
        pairs.sort();
        Ok(pairs)
    }

    /// Remove a non-leaf level, reattaching each dropped node's children
    /// to its parent.
    pub fn drop_level(&self, level: &str) -> Result<TaxonomyTree> {
        if level == self.leaf_level() {
            return Err(MapperError::InvalidTaxonomy(
                "cannot drop the leaf level".into(),
            ));
        }
        let idx = self
            .hierarchy
            .iter()
            .position(|l| l == level)
            .ok_or_else(|| MapperError::InvalidTaxonomy(format!("{level} is not a valid level")))?;

        let mut hierarchy = self.hierarchy.clone();
        hierarchy.remove(idx);
        let mut children = self.children.clone();
        let dropped = children
            .remove(level)
            .ok_or_else(|| MapperError::InvalidTaxonomy(format!("{level} has no node map")))?;

        if idx > 0 {
            let parent_level = &self.hierarchy[idx - 1];
            let parent_map = children.get_mut(parent_level).ok_or_else(|| {
                MapperError::InvalidTaxonomy(format!("{parent_level} has no node map"))
            })?;
            for kids in parent_map.values_mut() {
                let mut reattached = Vec::new();
                for kid in kids.iter() {
                    reattached.extend(dropped[kid].iter().cloned());
                }
                reattached.sort();
                *kids = reattached;
            }
        }

        let tree = Self {
            hierarchy,
            children,
            leaf_rows: self.leaf_rows.clone(),
        };
        tree.validate()?;
        Ok(tree)
    }
}

fn level_map<'a>(obj: &'a Map<String, Value>, level: &str) -> Result<&'a Map<String, Value>> {
    obj.get(level)
        .and_then(|v| v.as_object())
        .filter(|m| !m.is_empty())
        .ok_or_else(|| {
            MapperError::InvalidTaxonomy(format!("level {level} is missing or not a mapping"))
        })
}
