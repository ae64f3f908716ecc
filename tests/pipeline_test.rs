use ocidiff::fixtures::{ImageBuilder, LayerTar, MockEngine};
use ocidiff::{DiffOptions, DiffRunner};
use serde_json::json;

/// A small multi-layer image pair exercising whiteouts, devices and
/// package ownership through the public pipeline API.
fn build_engine() -> MockEngine {
    let mut engine = MockEngine::new();

    // Old image: a config file, a secret, and an owned library.
    let mut base = LayerTar::new();
    base.dir("etc");
    base.file("etc/app.conf", b"mode=simple\n", 0o644);
    base.file("etc/secret", b"hunter2\n", 0o600);
    base.dir("usr");
    base.dir("usr/lib");
    base.file("usr/lib/libapp.so", b"\x7fELF...", 0o755);
    let image = engine.add_image("app:1", ImageBuilder::new().with_seed(1).layer(base));
    image.set_packages(&["app-libs-1.0-1.el9"]);
    image.set_owned_files(&["/usr/lib/libapp.so"]);
    image.set_inspect(json!({"Config": {"Env": ["MODE=simple"]}}));
    image.set_history(&["/bin/sh -c #(nop) ADD file:rootfs in /"]);

    // New image: second layer deletes the secret, rewrites the config and
    // adds a device node.
    let mut base = LayerTar::new();
    base.dir("etc");
    base.file("etc/app.conf", b"mode=simple\n", 0o644);
    base.file("etc/secret", b"hunter2\n", 0o600);
    base.dir("usr");
    base.dir("usr/lib");
    base.file("usr/lib/libapp.so", b"\x7fELF...", 0o755);
    let mut update = LayerTar::new();
    update.whiteout("etc/secret");
    update.file("etc/app.conf", b"mode=fancy\n", 0o644);
    update.dir("dev");
    update.char_device("dev/null", 1, 3);
    let image = engine.add_image(
        "app:2",
        ImageBuilder::new().with_seed(2).layer(base).layer(update),
    );
    image.set_packages(&["app-libs-1.0-1.el9"]);
    image.set_owned_files(&["/usr/lib/libapp.so"]);
    image.set_inspect(json!({"Config": {"Env": ["MODE=fancy"]}}));
    image.set_history(&[
        "/bin/sh -c #(nop) ADD file:rootfs in /",
        "/bin/sh -c #(nop) COPY file:app.conf in /etc/",
    ]);

    engine
}

#[test]
fn whiteouts_devices_and_ownership_flow_through_the_pipeline() {
    let runner = DiffRunner::new(build_engine());
    let result = runner.diff("app:1", "app:2", &DiffOptions::default()).unwrap();

    let files = &result["files"];

    // The whited-out secret is gone from the second image.
    let removed = files["removed"].as_array().unwrap();
    assert!(removed
        .iter()
        .any(|item| item[0] == json!("/etc/secret")));

    // The device node is reported with a synthesized MIME but was never
    // materialized on disk.
    let added = files["added"].as_array().unwrap();
    assert!(added.contains(&json!(["/dev/null", "inode/chardevice; charset=binary"])));

    // The owned library never shows up even though its bytes changed hands.
    for bucket in ["added", "removed", "modified"] {
        for item in files[bucket].as_array().unwrap() {
            assert_ne!(item[0], json!("/usr/lib/libapp.so"));
        }
    }

    // Modified config carries a unified diff of its contents.
    let modified = files["modified"].as_array().unwrap();
    let conf = modified
        .iter()
        .find(|item| item[0] == json!("/etc/app.conf"))
        .expect("config file must be reported as modified");
    let diff = conf[2].as_array().unwrap();
    assert!(diff.iter().any(|l| l.as_str().unwrap() == "-mode=simple"));
    assert!(diff.iter().any(|l| l.as_str().unwrap() == "+mode=fancy"));

    // Same packages on both sides.
    assert_eq!(
        result["packages"],
        json!({"added": [], "removed": [], "modified": []})
    );

    // Metadata and history changes boil down to changed lines.
    let metadata = result["metadata"].as_array().unwrap();
    assert!(metadata.contains(&json!("-Config:Env = MODE=simple")));
    assert!(metadata.contains(&json!("+Config:Env = MODE=fancy")));

    let history = result["history"].as_array().unwrap();
    assert_eq!(
        history,
        &vec![json!("+COPY file:app.conf in /etc/")]
    );
}

#[test]
fn comparing_an_image_with_itself_is_empty() {
    let runner = DiffRunner::new(build_engine());
    let result = runner.diff("app:1", "app:1", &DiffOptions::default()).unwrap();

    assert_eq!(
        result["files"],
        json!({"added": [], "removed": [], "modified": []})
    );
    assert_eq!(
        result["packages"],
        json!({"added": [], "removed": [], "modified": []})
    );
    assert_eq!(result["metadata"], json!([]));
    assert_eq!(result["history"], json!([]));
}
