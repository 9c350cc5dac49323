use super::*;

fn store() -> (tempfile::TempDir, LocalFileStore) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = LocalFileStore::new(dir.path().join("uploads")).expect("store");
    (dir, store)
}

#[tokio::test]
async fn saves_under_request_and_kind_scope() {
    let (_dir, store) = store();
    let scope = FileScope::new("tok123", "file");
    let reference = store
        .save(&scope, "abc_report.pdf", b"%PDF-1.7")
        .await
        .expect("save");

    assert_eq!(reference.as_str(), "tok123/file/abc_report.pdf");
    assert_eq!(reference.request_token(), "tok123");
    assert_eq!(reference.file_name(), "abc_report.pdf");
    assert!(store.root().join("tok123").join("file").join("abc_report.pdf").exists());
    assert_eq!(store.retrieve(&reference).await.expect("read"), b"%PDF-1.7");
}

#[tokio::test]
async fn leaves_no_partial_file_behind() {
    let (_dir, store) = store();
    let scope = FileScope::new("tok", "file");
    store.save(&scope, "a.txt", b"hello").await.expect("save");

    let entries: Vec<String> = std::fs::read_dir(store.root().join("tok").join("file"))
        .expect("dir")
        .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(entries, vec!["a.txt".to_string()]);
}

#[tokio::test]
async fn retrieving_missing_file_is_not_found() {
    let (_dir, store) = store();
    let reference = StoredRef::parse("tok/file/missing.pdf").expect("reference");
    let err = store.retrieve(&reference).await.expect_err("missing");
    assert!(matches!(err, StorageError::NotFound(_)));
}

#[tokio::test]
async fn delete_is_idempotent() {
    let (_dir, store) = store();
    let reference = store
        .save(&FileScope::new("tok", "form"), "x.txt", b"x")
        .await
        .expect("save");
    store.delete(&reference).await.expect("delete");
    store.delete(&reference).await.expect("delete again");
    assert!(matches!(
        store.retrieve(&reference).await,
        Err(StorageError::NotFound(_))
    ));
}

#[tokio::test]
async fn delete_sweeps_interrupted_partial_write() {
    let (_dir, store) = store();
    let scope = FileScope::new("tok", "file");
    let reference = scope.reference_for("scan.pdf").expect("reference");
    let dir = store.root().join("tok").join("file");
    std::fs::create_dir_all(&dir).expect("dir");
    std::fs::write(dir.join(".scan.pdf.partial"), b"%PDF").expect("partial");

    store.delete(&reference).await.expect("delete");
    assert!(!dir.join(".scan.pdf.partial").exists());

    // The name is free again for a fresh save.
    store.save(&scope, "scan.pdf", b"%PDF-1.7").await.expect("save");
    assert_eq!(store.retrieve(&reference).await.expect("read"), b"%PDF-1.7");
}

#[tokio::test]
async fn deleting_request_scope_removes_all_kinds() {
    let (_dir, store) = store();
    store
        .save(&FileScope::new("tok", "file"), "a.pdf", b"a")
        .await
        .expect("save");
    store
        .save(&FileScope::new("tok", "drivers_license"), "b.png", b"b")
        .await
        .expect("save");
    let other = store
        .save(&FileScope::new("other", "file"), "c.pdf", b"c")
        .await
        .expect("save");

    store.delete_request_scope("tok").await.expect("delete scope");
    assert!(!store.root().join("tok").exists());
    assert_eq!(store.retrieve(&other).await.expect("other"), b"c");

    assert!(matches!(
        store.delete_request_scope("..").await,
        Err(StorageError::InvalidReference(_))
    ));
}

#[test]
fn rejects_traversal_and_absolute_references() {
    for raw in [
        "",
        "/etc/passwd",
        "\\windows\\system32",
        "../tok/file/a.pdf",
        "tok/../a.pdf",
        "tok/file/..",
        "tok//a.pdf",
        "tok/file/.hidden",
        "tok/file",
        "tok/file/a/b.pdf",
        "C:/file/a.pdf",
    ] {
        assert!(
            matches!(StoredRef::parse(raw), Err(StorageError::InvalidReference(_))),
            "{raw:?} should be rejected"
        );
    }
    assert!(StoredRef::parse("tok/file/3f2a_report.pdf").is_ok());
}

#[tokio::test]
async fn save_rejects_unsafe_file_names() {
    let (_dir, store) = store();
    let scope = FileScope::new("tok", "file");
    for name in ["../escape.pdf", "nested/name.pdf", ".hidden"] {
        assert!(
            matches!(
                store.save(&scope, name, b"x").await,
                Err(StorageError::InvalidReference(_))
            ),
            "{name:?} should be rejected"
        );
    }
}

#[test]
fn stored_ref_deserialization_validates() {
    let ok: StoredRef = serde_json::from_str("\"tok/file/a.pdf\"").expect("valid");
    assert_eq!(ok.as_str(), "tok/file/a.pdf");
    assert!(serde_json::from_str::<StoredRef>("\"../../etc/passwd\"").is_err());
}
