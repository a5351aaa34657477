use std::path::Path;

use anyhow::Context;

const MODEL_EXTENSIONS: &[&str] = &["gguf", "bin", "safetensors"];

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ModelFile {
    /// File name relative to the models directory; usable as a model reference.
    pub name: String,
    pub size_bytes: u64,
}

fn is_model_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| MODEL_EXTENSIONS.iter().any(|m| e.eq_ignore_ascii_case(m)))
}

/// Model files directly under `dir`, sorted by name. A missing directory is empty.
pub async fn list_models(dir: &Path) -> anyhow::Result<Vec<ModelFile>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("read models dir {}", dir.display())),
    };

    let mut out = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("read models dir {}", dir.display()))?
    {
        let path = entry.path();
        if !is_model_file(&path) {
            continue;
        }
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        out.push(ModelFile {
            name: entry.file_name().to_string_lossy().into_owned(),
            size_bytes: meta.len(),
        });
    }
    out.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(out)
}
