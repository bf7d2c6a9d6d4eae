mod common;

use std::fs;
use std::path::Path;

use common::{excavation_model, RecordingSolver};
use geostage::{
    config::PipelineConfig,
    datatypes::{MaterialCategory, Model},
    driver::CancellationToken,
    input::{load_model, load_schedule},
    pipeline::{prepare, run},
    post_processor::{write_all, CONSTRAINTS_FILE, STAGE_RESULTS_FILE, WARNINGS_FILE},
    stages::StageActivation,
};
use json::JsonValue;

fn category_name(category: MaterialCategory) -> &'static str {
    match category {
        MaterialCategory::Cohesive => "cohesive",
        MaterialCategory::Granular => "granular",
        MaterialCategory::Structural => "structural",
    }
}

fn id_array<T: Copy + Into<JsonValue>>(ids: impl IntoIterator<Item = T>) -> JsonValue {
    JsonValue::Array(ids.into_iter().map(Into::into).collect())
}

fn model_json(model: &Model) -> JsonValue {
    let mut root = JsonValue::new_object();

    root["nodes"] = JsonValue::Array(
        model
            .nodes
            .iter()
            .map(|node| {
                let mut value = JsonValue::new_object();
                value["id"] = node.id.into();
                value["x"] = node.position.x.into();
                value["y"] = node.position.y.into();
                value["z"] = node.position.z.into();
                value
            })
            .collect(),
    );
    root["elements"] = JsonValue::Array(
        model
            .elements
            .iter()
            .map(|element| {
                let mut value = JsonValue::new_object();
                value["id"] = element.id.into();
                value["type"] = element.type_tag.as_str().into();
                value["nodes"] = id_array(element.node_ids.iter().copied());
                value["material_id"] = element.material_id.into();
                value
            })
            .collect(),
    );
    root["materials"] = JsonValue::Array(
        model
            .materials
            .iter()
            .map(|material| {
                let mut value = JsonValue::new_object();
                value["id"] = material.material_id.into();
                value["category"] = category_name(material.category).into();
                value["friction_deg"] = material.friction_deg.into();
                value["cohesion_pa"] = material.cohesion_pa.into();
                value["elastic_modulus"] = material.elastic_modulus.into();
                value["poisson_ratio"] = material.poisson_ratio.into();
                value["density"] = material.density.into();
                value
            })
            .collect(),
    );
    root["load_groups"] = id_array(model.load_groups.iter().copied());
    root["boundary_groups"] = id_array(model.boundary_groups.iter().copied());
    root["prestress"] = JsonValue::Array(
        model
            .anchor_prestress
            .iter()
            .map(|(element, force)| {
                let mut value = JsonValue::new_object();
                value["element"] = (*element).into();
                value["force"] = (*force).into();
                value
            })
            .collect(),
    );

    root
}

const SCHEDULE: &str = r#"{
    "stages": [
        {"id": 1, "name": "Initial state", "materials": [1, 2, 5, 13],
         "loads": [1], "boundaries": [1]},
        {"id": 2, "name": "Excavate clay", "excavate": [1]},
        {"id": 3, "name": "Surcharge", "add_loads": [2]}
    ]
}"#;

const CONFIG: &str = r#"
[anchors]
free_band = 5.0

[coupling]
k = 4

[constitutive]
friction_floor_deg = 15.0
"#;

fn write_inputs(dir: &Path) {
    fs::write(dir.join("model.json"), model_json(&excavation_model()).pretty(2)).unwrap();
    fs::write(dir.join("schedule.json"), SCHEDULE).unwrap();
    fs::write(dir.join("geostage.toml"), CONFIG).unwrap();
}

fn csv_rows(path: &Path) -> Vec<csv::StringRecord> {
    let mut reader = csv::Reader::from_path(path).unwrap();
    reader.records().map(|r| r.unwrap()).collect()
}

#[test]
fn model_survives_the_json_file_format() {
    let dir = tempfile::tempdir().unwrap();
    write_inputs(dir.path());

    let loaded = load_model(&dir.path().join("model.json")).unwrap();
    let original = excavation_model();

    assert_eq!(loaded.nodes.len(), original.nodes.len());
    assert_eq!(loaded.elements, original.elements);
    assert_eq!(loaded.materials, original.materials);
    assert_eq!(loaded.load_groups, original.load_groups);
    assert_eq!(loaded.anchor_prestress, original.anchor_prestress);
    assert_eq!(loaded.nodes.position(5), original.nodes.position(5));
}

#[test]
fn schedule_file_mixes_explicit_and_delta_stages() {
    let dir = tempfile::tempdir().unwrap();
    write_inputs(dir.path());

    let schedule = load_schedule(&dir.path().join("schedule.json")).unwrap();

    assert_eq!(schedule.len(), 3);
    assert!(matches!(schedule.stages[0].activation, StageActivation::Explicit { .. }));
    assert!(matches!(schedule.stages[1].activation, StageActivation::Delta(_)));
    assert_eq!(schedule.stages[1].name, "Excavate clay");
}

#[test]
fn full_run_from_files_writes_result_tables() {
    let dir = tempfile::tempdir().unwrap();
    write_inputs(dir.path());

    let config = PipelineConfig::from_file(dir.path().join("geostage.toml")).unwrap();
    assert_eq!(config.coupling.k, 4);

    let model = load_model(&dir.path().join("model.json")).unwrap();
    let schedule = load_schedule(&dir.path().join("schedule.json")).unwrap();
    let prepared = prepare(model, &config).unwrap();
    let mut solver = RecordingSolver::default();
    let report =
        run(&prepared, &schedule, &mut solver, &config, CancellationToken::new()).unwrap();

    let output = dir.path().join("results");
    let written =
        write_all(&output, &report.stages, &prepared.constraints, &report.warnings).unwrap();
    assert_eq!(written.len(), 3);

    let stages = csv_rows(&output.join(STAGE_RESULTS_FILE));
    assert_eq!(stages.len(), 3);
    assert_eq!(&stages[0][1], "Initial state");
    assert_eq!(&stages[2][2], "completed");

    let masters: usize = prepared.constraints.iter().map(|c| c.masters.len()).sum();
    let constraints = csv_rows(&output.join(CONSTRAINTS_FILE));
    assert_eq!(constraints.len(), masters);
    assert!(prepared.constraints.iter().all(|c| c.masters.len() <= 4));
    assert!(constraints.iter().any(|row| &row[1] == "head_to_wall"));

    assert!(csv_rows(&output.join(WARNINGS_FILE)).is_empty());
}

#[test]
fn missing_model_file_is_an_input_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = load_model(&dir.path().join("absent.json")).unwrap_err();
    assert!(err.to_string().starts_with("Input error: Unable to open input file"));
}
