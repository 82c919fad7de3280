//! The scenario files shipped in the repository stay loadable and valid

use std::path::PathBuf;

use formprobe_harness::spec::ProjectSource;
use formprobe_harness::ScenarioSpec;

fn scenario_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../scenarios")
}

#[test]
fn shipped_scenarios_validate() {
    let specs = ScenarioSpec::load_all(&scenario_dir()).unwrap();
    assert!(!specs.is_empty());

    for spec in &specs {
        spec.validate().unwrap_or_else(|e| panic!("{}: {}", spec.name, e));
        let Some(ProjectSource::Directory(dir)) = &spec.project else {
            panic!("{}: expected a project directory", spec.name);
        };
        assert!(spec.base_dir().join(dir).join("Cargo.toml").is_file());
    }
}

#[test]
fn shipped_scenarios_cover_negative_case() {
    let specs = ScenarioSpec::load_all(&scenario_dir()).unwrap();
    let negative = ScenarioSpec::filter_by_tag(&specs, "negative");
    assert_eq!(negative.len(), 1);
    assert!(!negative[0].expect.success);
}
