use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use json::JsonValue;
use nalgebra::Point3;
use tracing::{debug, info};

use crate::{
    datatypes::{
        Element, ElementId, MaterialCategory, MaterialRecord, MeshSet, Model, Node, NodeArena,
    },
    error::{Result, StagingError},
    stages::{Schedule, StageActivation, StageDefinition, StageDelta},
};

/// Parses a json file into a JsonValue object
///
/// # Arguments
/// * `path` - The path to the json file
///
/// # Returns
/// A JsonValue object
pub fn load_json_file(path: &Path) -> Result<JsonValue> {
    let file_string = match std::fs::read_to_string(path) {
        Ok(f) => f,
        Err(err) => {
            return Err(StagingError::Input(format!(
                "Unable to open input file {}: {err}",
                path.display()
            )))
        }
    };

    match json::parse(&file_string) {
        Ok(value) => Ok(value),
        Err(err) => Err(StagingError::Input(format!(
            "Error in json file {}: {err}",
            path.display()
        ))),
    }
}

fn require_keys(value: &JsonValue, keys: &[&str], context: &str) -> Result<()> {
    for key in keys {
        if !value.has_key(key) {
            return Err(StagingError::Input(format!(
                "{context} is missing {key} field"
            )));
        }
    }
    Ok(())
}

fn require_f64(value: &JsonValue, key: &str, context: &str) -> Result<f64> {
    value[key]
        .as_f64()
        .ok_or_else(|| StagingError::Input(format!("Bad value for {key} in {context}")))
}

fn require_u64(value: &JsonValue, key: &str, context: &str) -> Result<u64> {
    value[key]
        .as_u64()
        .ok_or_else(|| StagingError::Input(format!("Bad value for {key} in {context}")))
}

fn require_u32(value: &JsonValue, key: &str, context: &str) -> Result<u32> {
    value[key]
        .as_u32()
        .ok_or_else(|| StagingError::Input(format!("Bad value for {key} in {context}")))
}

/// Reads an optional array of ids. A missing key gives an empty list.
fn id_list<T>(
    value: &JsonValue,
    key: &str,
    context: &str,
    convert: fn(&JsonValue) -> Option<T>,
) -> Result<Vec<T>> {
    let list = &value[key];
    if list.is_null() {
        return Ok(Vec::new());
    }
    if !list.is_array() {
        return Err(StagingError::Input(format!(
            "{key} in {context} must be an array"
        )));
    }
    list.members()
        .map(|member| {
            convert(member).ok_or_else(|| {
                StagingError::Input(format!("Bad id {member} in {key} of {context}"))
            })
        })
        .collect()
}

fn u32_set(value: &JsonValue, key: &str, context: &str) -> Result<BTreeSet<u32>> {
    Ok(id_list(value, key, context, JsonValue::as_u32)?.into_iter().collect())
}

fn u64_set(value: &JsonValue, key: &str, context: &str) -> Result<BTreeSet<u64>> {
    Ok(id_list(value, key, context, JsonValue::as_u64)?.into_iter().collect())
}

fn parse_node(value: &JsonValue) -> Result<Node> {
    require_keys(value, &["id", "x", "y", "z"], "Node")?;
    let id = require_u64(value, "id", "node")?;
    let context = format!("node {id}");

    Ok(Node {
        id,
        position: Point3::new(
            require_f64(value, "x", &context)?,
            require_f64(value, "y", &context)?,
            require_f64(value, "z", &context)?,
        ),
    })
}

fn parse_element(value: &JsonValue) -> Result<Element> {
    require_keys(value, &["id", "nodes", "material_id"], "Element")?;
    let id = require_u64(value, "id", "element")?;
    let context = format!("element {id}");

    // A missing type tag is not an input error; the classifier reports it
    let type_tag = value["type"].as_str().unwrap_or_default().to_owned();

    Ok(Element {
        id,
        type_tag,
        node_ids: id_list(value, "nodes", &context, JsonValue::as_u64)?,
        material_id: require_u32(value, "material_id", &context)?,
    })
}

fn parse_material(value: &JsonValue) -> Result<MaterialRecord> {
    require_keys(
        value,
        &[
            "id",
            "category",
            "elastic_modulus",
            "poisson_ratio",
            "density",
        ],
        "Material",
    )?;
    let material_id = require_u32(value, "id", "material")?;
    let context = format!("material {material_id}");

    let category_name = value["category"].as_str().unwrap_or_default();
    let category = MaterialCategory::parse(category_name).ok_or_else(|| {
        StagingError::Input(format!("Unknown category '{category_name}' in {context}"))
    })?;

    // Support materials commonly omit strength parameters
    let friction_deg = value["friction_deg"].as_f64().unwrap_or(0.0);
    let cohesion_pa = value["cohesion_pa"].as_f64().unwrap_or(0.0);
    if category != MaterialCategory::Structural {
        require_keys(value, &["friction_deg", "cohesion_pa"], &context)?;
    }

    Ok(MaterialRecord {
        material_id,
        friction_deg,
        cohesion_pa,
        category,
        elastic_modulus: require_f64(value, "elastic_modulus", &context)?,
        poisson_ratio: require_f64(value, "poisson_ratio", &context)?,
        density: require_f64(value, "density", &context)?,
    })
}

fn parse_mesh_set(value: &JsonValue) -> Result<MeshSet> {
    require_keys(value, &["id", "name"], "Mesh set")?;
    let id = require_u32(value, "id", "mesh set")?;
    let context = format!("mesh set {id}");

    Ok(MeshSet {
        id,
        name: value["name"].as_str().unwrap_or_default().to_owned(),
        node_ids: id_list(value, "nodes", &context, JsonValue::as_u64)?,
        element_ids: id_list(value, "elements", &context, JsonValue::as_u64)?,
    })
}

fn parse_prestress(value: &JsonValue) -> Result<BTreeMap<ElementId, f64>> {
    let mut forces = BTreeMap::new();
    for entry in value["prestress"].members() {
        require_keys(entry, &["element", "force"], "Prestress entry")?;
        let element = require_u64(entry, "element", "prestress entry")?;
        let force = require_f64(entry, "force", &format!("prestress of element {element}"))?;
        forces.insert(element, force);
    }
    Ok(forces)
}

/// Builds a Model from the model json
///
/// # Arguments
/// * `model_json` - The model file as a JsonValue object
///
/// # Returns
/// The validated model
pub fn parse_model(model_json: &JsonValue) -> Result<Model> {
    require_keys(model_json, &["nodes", "elements", "materials"], "Model json")?;

    let nodes = model_json["nodes"]
        .members()
        .map(parse_node)
        .collect::<Result<Vec<Node>>>()?;
    let elements = model_json["elements"]
        .members()
        .map(parse_element)
        .collect::<Result<Vec<Element>>>()?;
    let materials = model_json["materials"]
        .members()
        .map(parse_material)
        .collect::<Result<Vec<MaterialRecord>>>()?;
    let mesh_sets = model_json["mesh_sets"]
        .members()
        .map(parse_mesh_set)
        .collect::<Result<Vec<MeshSet>>>()?;

    let model = Model {
        nodes: NodeArena::from_nodes(nodes)?,
        elements,
        materials,
        mesh_sets,
        load_groups: u32_set(model_json, "load_groups", "model")?,
        boundary_groups: u32_set(model_json, "boundary_groups", "model")?,
        anchor_prestress: parse_prestress(model_json)?,
    };
    model.validate()?;

    info!(
        "loaded model with {} nodes, {} elements, {} materials and {} mesh sets",
        model.nodes.len(),
        model.elements.len(),
        model.materials.len(),
        model.mesh_sets.len()
    );

    Ok(model)
}

fn parse_stage(value: &JsonValue) -> Result<StageDefinition> {
    require_keys(value, &["id"], "Stage")?;
    let id = require_u32(value, "id", "stage")?;
    let context = format!("stage {id}");
    let name = value["name"]
        .as_str()
        .map(str::to_owned)
        .unwrap_or_else(|| format!("Stage {id}"));

    let activation = if value.has_key("materials") {
        StageActivation::Explicit {
            materials: u32_set(value, "materials", &context)?,
            loads: u32_set(value, "loads", &context)?,
            boundaries: u32_set(value, "boundaries", &context)?,
            inactive_elements: u64_set(value, "inactive_elements", &context)?,
        }
    } else {
        StageActivation::Delta(StageDelta {
            excavate: u32_set(value, "excavate", &context)?,
            backfill: u32_set(value, "backfill", &context)?,
            add_loads: u32_set(value, "add_loads", &context)?,
            remove_loads: u32_set(value, "remove_loads", &context)?,
            add_boundaries: u32_set(value, "add_boundaries", &context)?,
            remove_boundaries: u32_set(value, "remove_boundaries", &context)?,
            excavate_elements: u64_set(value, "excavate_elements", &context)?,
        })
    };
    debug!(stage = id, explicit = value.has_key("materials"), "parsed stage");

    Ok(StageDefinition {
        id,
        name,
        activation,
        declares_readdition: value["readdition"].as_bool().unwrap_or(false),
    })
}

/// Builds the stage schedule from the schedule json
pub fn parse_schedule(schedule_json: &JsonValue) -> Result<Schedule> {
    require_keys(schedule_json, &["stages"], "Schedule json")?;
    if !schedule_json["stages"].is_array() {
        return Err(StagingError::Input(
            "Schedule json stages field must be an array".to_owned(),
        ));
    }

    let stages = schedule_json["stages"]
        .members()
        .map(parse_stage)
        .collect::<Result<Vec<StageDefinition>>>()?;
    info!("loaded schedule with {} stage(s)", stages.len());

    Ok(Schedule::new(stages))
}

pub fn load_model(path: &Path) -> Result<Model> {
    parse_model(&load_json_file(path)?)
}

pub fn load_schedule(path: &Path) -> Result<Schedule> {
    parse_schedule(&load_json_file(path)?)
}
