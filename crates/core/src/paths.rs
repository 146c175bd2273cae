use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Paths {
    pub base: PathBuf,
}

impl Paths {
    pub fn new() -> Self {
        let base = dirs::home_dir()
            .map(|h| h.join(".tabrelay"))
            .unwrap_or_else(|| PathBuf::from(".tabrelay"));
        Self { base }
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn config_file(&self) -> PathBuf {
        self.base.join("config.json")
    }

    pub fn runtime_dir(&self) -> PathBuf {
        self.base.join("run")
    }

    pub fn socket_file(&self) -> PathBuf {
        self.runtime_dir().join("router.sock")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.runtime_dir().join("router.pid")
    }

    /// Cross-process startup lock taken by the helper that spawns the daemon.
    pub fn lock_file(&self) -> PathBuf {
        self.runtime_dir().join("router.lock")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base)?;
        std::fs::create_dir_all(self.runtime_dir())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o700);
            std::fs::set_permissions(self.runtime_dir(), perms)?;
        }
        Ok(())
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}
