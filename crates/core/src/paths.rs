use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Paths {
    pub base: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

impl Paths {
    pub fn new() -> Self {
        let base = dirs::home_dir()
            .map(|h| h.join(".agentwire"))
            .unwrap_or_else(|| PathBuf::from(".agentwire"));
        Self { base }
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn config_file(&self) -> PathBuf {
        self.base.join("config.json")
    }

    pub fn images_dir(&self) -> PathBuf {
        self.base.join("images")
    }

    pub fn image_file(&self, image_id: &str) -> PathBuf {
        self.images_dir()
            .join(format!("{}.json", safe_file_stem(image_id)))
    }

    pub fn definitions_dir(&self) -> PathBuf {
        self.base.join("definitions")
    }

    pub fn definition_file(&self, name: &str) -> PathBuf {
        self.definitions_dir()
            .join(format!("{}.json", safe_file_stem(name)))
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.base.join("sessions")
    }

    pub fn session_file(&self, session_id: &str) -> PathBuf {
        self.sessions_dir()
            .join(format!("{}.jsonl", safe_file_stem(session_id)))
    }
}

fn safe_file_stem(key: &str) -> String {
    key.replace([':', '/', '\\'], "_")
}
