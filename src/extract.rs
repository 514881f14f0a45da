use std::collections::HashSet;

use serde_json::Value;

use crate::domain::{AssetRecord, DandisetId, SubjectInfo, TypedObject};
use crate::tree::{NodeTree, ROOT};
use crate::value::{AttrValue, normalize_text};

pub const TYPE_ATTR: &str = "neurodata_type";
pub const DESCRIPTION_ATTR: &str = "description";

const SUBJECT_GROUP: &str = "/general/subject";

/// Collects every group below the root that carries a non-empty type tag.
pub fn extract_typed_objects(tree: &NodeTree) -> Vec<TypedObject> {
    let mut visited = HashSet::new();
    extract_typed_objects_from(tree, ROOT, &mut visited)
}

/// Depth-first, pre-order walk starting at `start`. A path already in `visited`
/// is neither reported nor descended into, so links back up the hierarchy
/// terminate. The starting node itself is never reported.
pub fn extract_typed_objects_from(
    tree: &NodeTree,
    start: &str,
    visited: &mut HashSet<String>,
) -> Vec<TypedObject> {
    let mut objects = Vec::new();
    let Some(start) = tree.get(start) else {
        return objects;
    };
    if !visited.insert(start.path().to_string()) {
        return objects;
    }

    let mut stack = tree
        .children(start)
        .filter(|child| child.is_group())
        .collect::<Vec<_>>();
    stack.reverse();

    while let Some(node) = stack.pop() {
        if !visited.insert(node.path().to_string()) {
            continue;
        }
        if let Some(type_tag) = node.attr(TYPE_ATTR).map(attr_text).filter(|tag| !tag.is_empty()) {
            let description = node
                .attr(DESCRIPTION_ATTR)
                .map(attr_text)
                .unwrap_or_default();
            objects.push(TypedObject {
                path: node.path().to_string(),
                type_tag,
                description,
            });
        }
        let before = stack.len();
        stack.extend(
            tree.children(node)
                .filter(|child| child.is_group() && !visited.contains(child.path())),
        );
        stack[before..].reverse();
    }
    objects
}

/// Builds the cached record for one NWB asset. Absent fields become `None`.
pub fn asset_record(dataset_id: &DandisetId, asset_id: &str, tree: &NodeTree) -> AssetRecord {
    AssetRecord {
        dataset_id: dataset_id.clone(),
        asset_id: asset_id.to_string(),
        typed_objects: extract_typed_objects(tree),
        session_description: field(tree, "/session_description"),
        subject: SubjectInfo {
            age: subject_field(tree, "age"),
            genotype: subject_field(tree, "genotype"),
            sex: subject_field(tree, "sex"),
            species: subject_field(tree, "species"),
            subject_id: subject_field(tree, "subject_id"),
            strain: subject_field(tree, "strain"),
            specimen_name: subject_field(tree, "specimen_name"),
        },
    }
}

fn subject_field(tree: &NodeTree, name: &str) -> Option<Value> {
    field(tree, &format!("{SUBJECT_GROUP}/{name}"))
}

fn field(tree: &NodeTree, path: &str) -> Option<Value> {
    tree.value_at(path).map(normalize_text)
}

fn attr_text(value: &AttrValue) -> String {
    match normalize_text(value) {
        Value::String(text) => text,
        other => other.to_string(),
    }
}
