use super::*;

#[test]
fn parses_minimal_noop_manifest() {
    let manifest = Manifest::from_json(
        r#"{ "pipeline": { "stages": [ { "name": "org.osbuild.noop" } ] } }"#,
    )
    .unwrap();
    assert_eq!(manifest.pipeline.stages.len(), 1);
    assert_eq!(manifest.pipeline.stages[0].name, "org.osbuild.noop");
    assert_eq!(manifest.pipeline.stages[0].options, Value::Object(Default::default()));
}

#[test]
fn parses_ordered_references() {
    let manifest = Manifest::from_json(
        r#"{
            "pipeline": {
                "stages": [ {
                    "name": "org.osbuild.rpm",
                    "inputs": {
                        "packages": {
                            "type": "org.osbuild.files",
                            "origin": "org.osbuild.source",
                            "references": ["sha256:aa", "sha256:bb"]
                        }
                    }
                } ]
            }
        }"#,
    )
    .unwrap();
    let input = &manifest.pipeline.stages[0].inputs["packages"];
    assert_eq!(input.origin, Origin::Source);
    assert_eq!(
        input.references.hashes_in_identifier_order(),
        vec!["sha256:aa", "sha256:bb"]
    );
}

#[test]
fn parses_keyed_references_with_metadata() {
    let manifest = Manifest::from_json(
        r#"{
            "pipeline": {
                "stages": [ {
                    "name": "org.osbuild.rpm",
                    "inputs": {
                        "packages": {
                            "type": "org.osbuild.files",
                            "origin": "org.osbuild.source",
                            "references": {
                                "sha256:aa": { "metadata": { "rpm.check_gpg": true } }
                            }
                        }
                    }
                } ]
            }
        }"#,
    )
    .unwrap();
    let input = &manifest.pipeline.stages[0].inputs["packages"];
    assert!(matches!(input.references, References::Keyed(_)));
}

#[test]
fn rejects_malformed_metadata_key() {
    let result = Manifest::from_json(
        r#"{
            "pipeline": {
                "stages": [ {
                    "name": "org.osbuild.rpm",
                    "inputs": {
                        "packages": {
                            "type": "org.osbuild.files",
                            "origin": "org.osbuild.source",
                            "references": {
                                "sha256:aa": { "metadata": { "badkey": true } }
                            }
                        }
                    }
                } ]
            }
        }"#,
    );
    assert!(result.is_err());
}

#[test]
fn parses_build_pipeline_chain() {
    let manifest = Manifest::from_json(
        r#"{
            "pipeline": {
                "build": {
                    "stages": [ { "name": "org.osbuild.bootstrap" } ]
                },
                "stages": [ { "name": "org.osbuild.rpm" } ],
                "assembler": { "name": "org.osbuild.qemu" }
            }
        }"#,
    )
    .unwrap();
    assert!(manifest.pipeline.build.is_some());
    assert_eq!(manifest.pipeline.stages_including_assembler().len(), 2);
}

#[test]
fn rejects_invalid_json() {
    assert!(Manifest::from_json("not json").is_err());
}
