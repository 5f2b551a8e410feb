//! End-to-end tests for layer archiving round-trips.

use layerstack::layer::Layer;
use tempfile::tempdir;
use tokio::fs;

#[test_log::test(tokio::test)]
async fn test_layer_archive_roundtrip() -> anyhow::Result<()> {
    let temp = tempdir()?;

    let source = Layer::new("source", temp.path())?;
    source.create().await?;
    fs::write(source.path().join("a.txt"), "alpha").await?;
    fs::create_dir(source.path().join("nested")).await?;
    fs::write(source.path().join("nested/b.txt"), "beta").await?;
    std::os::unix::fs::symlink("a.txt", source.path().join("link"))?;

    let tarball = source.archive().await?;
    assert!(tarball.verify().await?);

    let dest = Layer::new("dest", temp.path())?;
    dest.create().await?;
    dest.unarchive(tarball.path()).await?;

    assert_eq!(
        fs::read_to_string(dest.path().join("a.txt")).await?,
        "alpha"
    );
    assert_eq!(
        fs::read_to_string(dest.path().join("nested/b.txt")).await?,
        "beta"
    );

    fs::remove_file(tarball.path()).await?;
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_layer_unarchive_overwrites_existing_files() -> anyhow::Result<()> {
    let temp = tempdir()?;

    let source = Layer::new("source", temp.path())?;
    source.create().await?;
    fs::write(source.path().join("config.txt"), "new contents").await?;

    let tarball = source.archive().await?;

    let dest = Layer::new("dest", temp.path())?;
    dest.create().await?;
    fs::write(dest.path().join("config.txt"), "old contents that are longer").await?;

    dest.unarchive(tarball.path()).await?;
    assert_eq!(
        fs::read_to_string(dest.path().join("config.txt")).await?,
        "new contents"
    );

    fs::remove_file(tarball.path()).await?;
    Ok(())
}
