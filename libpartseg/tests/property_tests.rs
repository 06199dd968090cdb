use std::sync::Arc;

use ndarray::Array3;
use partseg::*;
use proptest::prelude::*;

fn element(value: u32) -> HistoryElement {
    let segmentation = Array3::from_elem((1, 2, 3), value);
    HistoryElement::create(
        AlgorithmChoice::new("step", parameter_map([("value", i64::from(value))])),
        MaskProperty::default(),
        &segmentation,
        &segmentation,
        None,
    )
    .unwrap()
}

fn descriptor() -> AlgorithmDescriptor {
    let entry: Arc<dyn Algorithm> =
        Arc::new(|image: &Image, _: &ParameterSet| Ok(AlgorithmOutput::new(Array3::zeros(image.spatial_shape()))));
    AlgorithmDescriptor::new("threshold", entry)
        .with_field(FieldSchema::int("value", "Value", 8000, 0..=65535))
        .with_migration(Version::new(0, 1, 0), |mut values: ParameterMap| {
            if let Some(old) = values.remove("level") {
                values.insert("value".to_string(), old);
            }
            values
        })
}

proptest! {
    #[test]
    fn undo_then_redo_restores_state(values in prop::collection::vec(0u32..1000, 1..8), undos in 0usize..8) {
        let mut log = HistoryLog::new();
        for value in &values {
            log.push(element(*value));
        }
        for _ in 0..undos.min(values.len()) {
            log.undo();
        }
        let before = log.clone();
        if log.can_undo() {
            log.undo();
            log.redo();
            prop_assert_eq!(&log, &before);
        }
        let current = log.current().map(|e| e.arrays().unwrap().segmentation);
        let expected = before.current().map(|e| e.arrays().unwrap().segmentation);
        prop_assert_eq!(current, expected);
    }

    #[test]
    fn push_after_undo_discards_branch(values in prop::collection::vec(0u32..1000, 3..8), extra in 0u32..1000) {
        let mut log = HistoryLog::new();
        for value in &values {
            log.push(element(*value));
        }
        log.undo();
        log.push(element(extra));

        prop_assert_eq!(log.len(), values.len());
        prop_assert!(log.undone().is_empty());
        let recorded: Vec<ParameterMap> = log.done().iter().map(|e| e.algorithm().values.clone()).collect();
        let mut expected: Vec<ParameterMap> = values[..values.len() - 1]
            .iter()
            .map(|v| parameter_map([("value", i64::from(*v))]))
            .collect();
        expected.push(parameter_map([("value", i64::from(extra))]));
        prop_assert_eq!(recorded, expected);
    }

    #[test]
    fn migrate_current_version_is_identity(value in 0i64..65536, extra in "[a-z]{1,8}") {
        let descriptor = descriptor();
        let raw = parameter_map([("value", ParameterValue::Int(value)), (extra.as_str(), ParameterValue::Bool(true))]);
        let migrated = migrate(&descriptor, &descriptor.version(), raw.clone()).unwrap();
        prop_assert_eq!(migrated, raw);
    }

    #[test]
    fn migrate_then_build_accepts_old_mappings(value in 0i64..65536) {
        let descriptor = descriptor();
        let old = parameter_map([("level", value)]);
        let parameters = build_versioned(&descriptor, Some(&Version::default()), &old).unwrap();
        prop_assert_eq!(parameters.int("value").unwrap(), value);
    }
}
