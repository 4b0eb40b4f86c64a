use db::Store;
use tempfile::TempDir;

pub async fn setup_store() -> (TempDir, Store) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("hive.db").display());
    let store = Store::connect(&url).await.unwrap();
    (dir, store)
}
