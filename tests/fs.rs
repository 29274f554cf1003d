mod common;

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;

fn c_path(path: &Path) -> Result<CString> {
    Ok(CString::new(path.as_os_str().as_bytes())?)
}

#[test]
fn open_write_fsync_close() -> Result<()> {
    let runtime = common::TestRuntime::new();
    let master = common::master(&runtime);

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("out.txt");
    let cpath = c_path(&path)?;

    let mut group = common::FiberGroup::new(master.clone(), runtime.clone());
    let engine = master.clone();
    group.spawn(move || {
        let timeout = Some(Duration::from_secs(1));
        let fd = engine
            .open(&cpath, libc::O_CREAT | libc::O_WRONLY, 0o644, timeout)
            .expect("open");
        assert!(fd >= 0);

        let n = engine.pwrite(fd, b"engine", 0, 0, timeout).expect("pwrite");
        assert_eq!(n, 6);
        engine.fsync(fd, timeout).expect("fsync");
        engine.fdatasync(fd, timeout).expect("fdatasync");
        engine.close(fd, timeout).expect("close");
    });
    group.run();

    assert_eq!(std::fs::read(&path)?, b"engine");
    Ok(())
}

#[test]
fn mkdir_creates_a_directory() -> Result<()> {
    let runtime = common::TestRuntime::new();
    let master = common::master(&runtime);

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("subdir");
    let cpath = c_path(&path)?;

    let mut group = common::FiberGroup::new(master.clone(), runtime.clone());
    let engine = master.clone();
    group.spawn(move || {
        engine
            .mkdir(&cpath, 0o755, Some(Duration::from_secs(1)))
            .expect("mkdir");
    });
    group.run();

    assert!(path.is_dir());
    Ok(())
}
