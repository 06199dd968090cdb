use std::io::{Cursor, Seek, SeekFrom};
use std::sync::{Arc, Mutex};

use ndarray::{Array3, Array4};
use partseg::container::ArchiveWriter;
use partseg::image::DEFAULT_SPACING;
use partseg::*;

fn threshold(image: &Image, parameters: &ParameterSet) -> Result<AlgorithmOutput> {
    let level = parameters.int("value")?;
    let index = image
        .channel_index(parameters.channel("channel")?)
        .ok_or(PartSegError::MissingData("channel"))?;
    let channel = image.channel(index).ok_or(PartSegError::MissingData("channel"))?;
    let mut segmentation = channel.mapv(|v| u32::from(i64::from(v) >= level));
    if let Some(mask) = image.mask() {
        ndarray::Zip::from(&mut segmentation)
            .and(mask)
            .for_each(|s, &m| *s *= u32::from(m > 0));
    }
    let full = segmentation.mapv(|v| v * 2);
    Ok(AlgorithmOutput::new(segmentation).with_full_segmentation(full))
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn registry() -> Arc<AlgorithmRegistry> {
    let registry = Arc::new(AlgorithmRegistry::new());
    registry
        .register(
            AlgorithmDescriptor::new("threshold", Arc::new(threshold))
                .with_field(FieldSchema::int("value", "Value", 8000, 0..=65535))
                .with_field(FieldSchema::channel("channel", "Channel")),
            &["Fixed threshold"],
        )
        .expect("register threshold");
    registry
}

fn image() -> Image {
    let data = Array4::from_shape_fn((3, 8, 8, 2), |(z, y, x, c)| ((z * 64 + y * 8 + x) * (c + 1)) as u16);
    Image::new(data, [2e-7, 6.5e-8, 6.5e-8])
        .expect("valid image")
        .with_file_path("cells.tif")
}

fn settings_with_history() -> Settings {
    init_logging();
    let mut settings = Settings::new(registry());
    settings.set_image(image()).unwrap();
    settings
        .run_step("threshold", &parameter_map([("value", 100)]))
        .unwrap();
    settings.derive_mask(MaskProperty::simple()).unwrap();
    settings
        .run_step(
            "threshold",
            &parameter_map([
                ("value", ParameterValue::Int(150)),
                ("channel", ParameterValue::Channel(Channel::Index(1))),
            ]),
        )
        .unwrap();
    settings
}

fn save(project: &ProjectTuple) -> Vec<u8> {
    save_project_to_bytes(project, &ArchiveOptions::default()).unwrap()
}

/// Rewrite an archive keeping only members accepted by `keep`
fn filtered(bytes: &[u8], keep: impl Fn(&str) -> bool) -> Vec<u8> {
    let archive = OpenArchive::from_bytes(bytes).unwrap();
    let mut writer = ArchiveWriter::new(ArchiveCompression::default());
    for name in archive.names().filter(|name| keep(*name)) {
        writer.add(name, archive.member(name).unwrap().to_vec());
    }
    writer.into_bytes().unwrap()
}

fn replaced(bytes: &[u8], member: &str, content: &[u8]) -> Vec<u8> {
    let archive = OpenArchive::from_bytes(bytes).unwrap();
    let mut writer = ArchiveWriter::new(ArchiveCompression::default());
    for name in archive.names() {
        let data = if name == member { content } else { archive.member(name).unwrap() };
        writer.add(name, data.to_vec());
    }
    writer.into_bytes().unwrap()
}

#[test]
fn test_threshold_scenario() {
    let descriptor = registry().resolve("threshold").unwrap();
    let parameters = build(&descriptor, &ParameterMap::new()).unwrap();
    assert_eq!(parameters.get("value"), Some(&ParameterValue::Int(8000)));

    let err = build(&descriptor, &parameter_map([("value", 70000)])).unwrap_err();
    assert!(matches!(err, PartSegError::ParameterValidation { ref field, .. } if field == "value"));

    let err = build(&descriptor, &parameter_map([("unknown_field", 1)])).unwrap_err();
    assert_eq!(err.field(), Some("unknown_field"));
}

#[test]
fn test_old_name_resolves() {
    assert_eq!(registry().resolve("Fixed threshold").unwrap().name(), "threshold");
}

#[test]
fn test_round_trip_law() {
    let settings = settings_with_history();
    let project = settings.current_project_tuple().unwrap();
    assert_eq!(project.history.len(), 2);
    assert!(project.mask.is_some());

    let loaded = load_project(&mut Cursor::new(save(&project))).unwrap();
    assert_eq!(loaded, project);
    assert_eq!(loaded.image.spacing(), project.image.spacing());
    for (stored, original) in loaded.history.iter().zip(&project.history) {
        assert_eq!(stored.array_bytes(), original.array_bytes());
        assert_eq!(stored.algorithm(), original.algorithm());
    }
}

#[test]
fn test_resume_from_saved_project() {
    let settings = settings_with_history();
    let bytes = save(&settings.current_project_tuple().unwrap());

    let mut resumed = Settings::new(registry());
    resumed.adopt(load_project(&mut Cursor::new(bytes)).unwrap()).unwrap();
    assert_eq!(resumed.segmentation(), settings.segmentation());
    assert_eq!(resumed.history().len(), 2);

    assert!(resumed.undo().unwrap());
    assert_eq!(resumed.history().cursor(), 1);
    assert!(resumed.verify_step(0).unwrap());
    assert!(resumed.verify_step(1).unwrap());
    assert!(resumed.undo().unwrap());
    assert!(resumed.segmentation().is_none());
    assert!(!resumed.can_undo());
    assert!(resumed.redo().unwrap());
    assert!(resumed.redo().unwrap());
    assert_eq!(resumed.segmentation(), settings.segmentation());
}

#[test]
fn test_round_trip_through_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("project.tgz");
    let project = settings_with_history().current_project_tuple().unwrap();

    save_project_to_path(&project, &path, &ArchiveOptions::default()).unwrap();
    let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
    assert_eq!(entries.len(), 1);

    let loaded = load_project(path.as_path()).unwrap();
    assert_eq!(loaded, project);
    assert_eq!(loaded.file_path, path);
}

#[test]
fn test_plain_tar_is_accepted() {
    let project = settings_with_history().current_project_tuple().unwrap();
    let options = ArchiveOptions::default().with_compression(ArchiveCompression::None);
    let bytes = save_project_to_bytes(&project, &options).unwrap();
    assert_eq!(load_project(&mut Cursor::new(bytes)).unwrap(), project);
}

#[test]
fn test_bzip2_project_round_trip() {
    let project = settings_with_history().current_project_tuple().unwrap();
    let options = ArchiveOptions::default().with_compression(ArchiveCompression::Bzip2 { level: 9 });
    let bytes = save_project_to_bytes(&project, &options).unwrap();
    assert!(bytes.starts_with(b"BZh"));
    assert_eq!(load_project(&mut Cursor::new(bytes)).unwrap(), project);
}

#[test]
fn test_archive_without_history_or_mask() {
    let segmentation = Array3::from_elem((3, 8, 8), 1u32);
    let project = ProjectTuple::new(image()).with_segmentation(segmentation, None);
    let loaded = load_project(&mut Cursor::new(save(&project))).unwrap();
    assert!(loaded.history.is_empty());
    assert!(loaded.mask.is_none());
    assert!(loaded.algorithm.is_none());
}

#[test]
fn test_history_group_removed_gives_empty_history() {
    let bytes = save(&settings_with_history().current_project_tuple().unwrap());
    let stripped = filtered(&bytes, |name| !name.starts_with("history/"));
    let loaded = load_project(&mut Cursor::new(stripped)).unwrap();
    assert!(loaded.history.is_empty());
}

#[test]
fn test_missing_mandatory_members() {
    let bytes = save(&settings_with_history().current_project_tuple().unwrap());
    for member in ["image.tif", "segmentation.npz"] {
        let broken = filtered(&bytes, |name| name != member);
        let err = load_project(&mut Cursor::new(broken)).unwrap_err();
        assert!(matches!(err, PartSegError::CorruptArchive(_)), "{member}: {err}");
    }
}

#[test]
fn test_missing_history_arrays_fails_whole_load() {
    let bytes = save(&settings_with_history().current_project_tuple().unwrap());
    let broken = filtered(&bytes, |name| name != "history/arrays_1.npz");
    let err = load_project(&mut Cursor::new(broken)).unwrap_err();
    assert!(matches!(err, PartSegError::CorruptArchive(ref msg) if msg.contains("arrays_1")));
}

#[test]
fn test_broken_json_members() {
    let bytes = save(&settings_with_history().current_project_tuple().unwrap());
    for member in ["algorithm.json", "history/history.json"] {
        let broken = replaced(&bytes, member, b"{\"algorithm_name\": ");
        let err = load_project(&mut Cursor::new(broken)).unwrap_err();
        assert!(err.is_corruption(), "{member}: {err}");
    }
    let broken = replaced(&bytes, "segmentation.npz", b"not a zip");
    assert!(load_project(&mut Cursor::new(broken)).unwrap_err().is_corruption());
}

#[test]
fn test_unknown_marker_survives_load() {
    let bytes = save(&settings_with_history().current_project_tuple().unwrap());
    let json = br#"{"algorithm_name": "threshold", "values": {"value": 5, "extra": {"__class__": "FutureType", "__values__": {}}}}"#;
    let loaded = load_project(&mut Cursor::new(replaced(&bytes, "algorithm.json", json))).unwrap();
    let values = loaded.algorithm.unwrap().values;
    assert!(matches!(values.get("extra"), Some(ParameterValue::Mapping(_))));
}

#[test]
fn test_stream_stays_open_and_positioned_data_is_read() {
    let project = settings_with_history().current_project_tuple().unwrap();
    let mut stream = Cursor::new(save(&project));

    let first = load_project(&mut stream).unwrap();
    stream.seek(SeekFrom::Start(0)).unwrap();
    let second = load_project(&mut stream).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_open_handle_is_borrowed() {
    let project = settings_with_history().current_project_tuple().unwrap();
    let archive = OpenArchive::from_bytes(&save(&project)).unwrap();
    assert_eq!(load_project(&archive).unwrap(), project);
    assert_eq!(load_project(&archive).unwrap(), project);
    assert!(archive.contains("image.tif"));
}

#[test]
fn test_failed_adopt_keeps_state() {
    let mut settings = settings_with_history();
    let before = settings.current_project_tuple().unwrap();
    let mut broken = before.clone();
    broken.mask = Some(Array3::zeros((1, 2, 2)));
    assert!(settings.adopt(broken).is_err());
    assert_eq!(settings.current_project_tuple().unwrap(), before);
}

#[test]
fn test_observers_notified_on_adopt() {
    let project = settings_with_history().current_project_tuple().unwrap();
    let mut settings = Settings::new(registry());
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    settings.subscribe(move |event| sink.lock().unwrap().push(event));

    settings.adopt(project.clone()).unwrap();
    assert_eq!(
        *events.lock().unwrap(),
        vec![
            ChangeEvent::ImageChanged,
            ChangeEvent::MaskChanged,
            ChangeEvent::SegmentationChanged,
            ChangeEvent::HistoryChanged,
        ]
    );

    events.lock().unwrap().clear();
    settings.adopt(ProjectTuple::new(project.image.clone())).unwrap();
    assert!(!events.lock().unwrap().contains(&ChangeEvent::ImageChanged));
    assert_eq!(settings.history().len(), 2);
}

#[test]
fn test_load_on_worker_thread() {
    let bytes = save(&settings_with_history().current_project_tuple().unwrap());
    let handle = std::thread::spawn(move || load_project(&mut Cursor::new(bytes)));
    let project = handle.join().unwrap().unwrap();
    let mut settings = Settings::new(registry());
    settings.adopt(project).unwrap();
    assert!(settings.can_undo());
}

#[test]
fn test_mask_image_reader() {
    let mask = Image::new(Array4::from_elem((3, 8, 8, 1), 1u16), DEFAULT_SPACING).unwrap();
    let mut image_bytes = Cursor::new(tiff_image::encode_image(&image()).unwrap());
    let mut mask_bytes = Cursor::new(tiff_image::encode_image(&mask).unwrap());
    let read = TiffImageReader
        .read((&mut image_bytes).into(), Some((&mut mask_bytes).into()))
        .unwrap();
    assert_eq!(read.mask().map(|m| m.dim()), Some((3, 8, 8)));
}

#[cfg(feature = "async")]
#[tokio::test]
async fn test_async_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("async.tgz");
    let project = settings_with_history().current_project_tuple().unwrap();
    save_project_async(project.clone(), path.clone(), ArchiveOptions::default())
        .await
        .unwrap();
    assert_eq!(load_project_async(path).await.unwrap(), project);
}
