mod common;

use common::GameFixture;
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::Duration;
use strata::MountController;

/// Real-mount tests need a FUSE device and the fusermount helper; skip
/// gracefully where the environment does not provide them (containers, CI
/// without --device /dev/fuse).
fn fuse_available() -> bool {
    Path::new("/dev/fuse").exists()
}

fn try_mount(controller: &mut MountController, fixture: &GameFixture, mods: Vec<(String, std::path::PathBuf)>) -> bool {
    match controller.mount(&fixture.game_dir, "Data", &fixture.overwrite_dir, mods) {
        Ok(()) => {
            std::thread::sleep(Duration::from_millis(200));
            true
        }
        Err(e) => {
            eprintln!("Skipping real FUSE test - mount failed: {}", e);
            false
        }
    }
}

/// Full lifecycle over a real mount: passthrough reads, mod override,
/// copy-on-write capture, create/rename through the projection, fold-back
/// on unmount and overwrite layering after a remount.
#[test]
fn test_mount_lifecycle() {
    if !fuse_available() {
        eprintln!("Skipping real FUSE test - /dev/fuse not available");
        return;
    }

    let fixture = GameFixture::new();
    fixture.write_base("Skyrim.esm", b"master file");
    fixture.write_base("Textures/a.dds", &[1, 2, 3, 4, 5]);
    fixture.write_base("Meshes/x.nif", b"0123456789");
    let (name, path) = fixture.add_mod("A", &[("Meshes/x.nif", b"seven!!")]);

    let mut controller = MountController::new();
    if !try_mount(&mut controller, &fixture, vec![(name, path)]) {
        return;
    }

    let data = &fixture.data_dir;

    // Base passthrough
    let mut names: Vec<String> = fs::read_dir(data)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort_unstable();
    assert_eq!(names, vec!["Meshes", "Skyrim.esm", "Textures"]);
    assert_eq!(fs::read(data.join("Textures/a.dds")).unwrap(), vec![1, 2, 3, 4, 5]);

    // Mod override wins content and size
    assert_eq!(fs::metadata(data.join("Meshes/x.nif")).unwrap().len(), 7);
    assert_eq!(fs::read(data.join("Meshes/x.nif")).unwrap(), b"seven!!");

    // Read-only opens of base files must not materialize a staging copy
    assert!(!fixture.staging_dir.join("Textures/a.dds").exists());

    // Copy-on-write: patch the base texture in place
    {
        let mut file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(data.join("Textures/a.dds"))
            .unwrap();
        file.seek(SeekFrom::Start(2)).unwrap();
        file.write_all(&[0xff, 0xff]).unwrap();
    }
    assert_eq!(
        fs::read(fixture.staging_dir.join("Textures/a.dds")).unwrap(),
        vec![1, 2, 0xff, 0xff, 5]
    );
    let mut buf = Vec::new();
    fs::File::open(data.join("Textures/a.dds"))
        .unwrap()
        .read_to_end(&mut buf)
        .unwrap();
    assert_eq!(buf, vec![1, 2, 0xff, 0xff, 5]);

    // Deleting a base-only file is refused
    let err = fs::remove_file(data.join("Skyrim.esm")).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::PermissionDenied);
    assert!(data.join("Skyrim.esm").exists());

    // Create and rename through the projection
    fs::create_dir(data.join("Foo")).unwrap();
    fs::write(data.join("Foo/bar.txt"), b"fresh").unwrap();
    assert!(fixture.staging_dir.join("Foo/bar.txt").exists());

    fs::create_dir(data.join("Baz")).unwrap();
    fs::rename(data.join("Foo/bar.txt"), data.join("Baz/qux.txt")).unwrap();
    assert!(!data.join("Foo/bar.txt").exists());
    assert_eq!(fs::read(data.join("Baz/qux.txt")).unwrap(), b"fresh");
    assert!(fixture.staging_dir.join("Baz/qux.txt").exists());

    // Unmount folds staging into overwrite and reveals the untouched base
    controller.unmount();
    assert!(!fixture.staging_dir.exists());
    assert_eq!(
        fs::read(fixture.overwrite_dir.join("Textures/a.dds")).unwrap(),
        vec![1, 2, 0xff, 0xff, 5]
    );
    assert_eq!(
        fs::read(fixture.overwrite_dir.join("Baz/qux.txt")).unwrap(),
        b"fresh"
    );
    assert_eq!(
        fs::read(fixture.data_dir.join("Textures/a.dds")).unwrap(),
        vec![1, 2, 3, 4, 5]
    );

    // Remount: the overwrite layer now provides the mutated bytes
    if !try_mount(&mut controller, &fixture, Vec::new()) {
        return;
    }
    assert_eq!(
        fs::read(data.join("Textures/a.dds")).unwrap(),
        vec![1, 2, 0xff, 0xff, 5]
    );
    assert_eq!(fs::read(data.join("Baz/qux.txt")).unwrap(), b"fresh");
    controller.unmount();
}

/// Live rebuild swaps the winning mod without remounting; a live flush
/// folds staged writes and keeps serving them from overwrite.
#[test]
fn test_live_rebuild_and_flush() {
    if !fuse_available() {
        eprintln!("Skipping real FUSE test - /dev/fuse not available");
        return;
    }

    let fixture = GameFixture::new();
    fixture.write_base("plugin.esp", b"base bytes");
    // Same length on purpose: the kernel caches the size from the first
    // lookup for the full TTL, and a rebuild only swaps the tree.
    let (name_a, path_a) = fixture.add_mod("A", &[("plugin.esp", b"from A!")]);
    let (name_b, path_b) = fixture.add_mod("B", &[("plugin.esp", b"from B!")]);

    let mut controller = MountController::new();
    if !try_mount(&mut controller, &fixture, vec![(name_a, path_a)]) {
        return;
    }

    let data = &fixture.data_dir;
    assert_eq!(fs::read(data.join("plugin.esp")).unwrap(), b"from A!");

    controller.rebuild(vec![(name_b, path_b)], &fixture.overwrite_dir, "Data");
    assert_eq!(fs::read(data.join("plugin.esp")).unwrap(), b"from B!");

    // Capture a write, then fold it without unmounting
    fs::write(data.join("notes.txt"), b"captured").unwrap();
    assert!(fixture.staging_dir.join("notes.txt").exists());

    controller.flush_staging_live();
    assert!(fixture.overwrite_dir.join("notes.txt").exists());
    assert!(!fixture.staging_dir.join("notes.txt").exists());
    assert_eq!(fs::read(data.join("notes.txt")).unwrap(), b"captured");

    controller.unmount();
}
