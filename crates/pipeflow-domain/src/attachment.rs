//! Attachments: entidad externa que el motor sólo lee y crea.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttachableKind {
    Sample,
    WorkflowExecution,
    SamplesWorkflowExecution,
}

impl AttachableKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sample => "Sample",
            Self::WorkflowExecution => "WorkflowExecution",
            Self::SamplesWorkflowExecution => "SamplesWorkflowExecution",
        }
    }
}

/// Dueño polimórfico de un attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Attachable {
    pub kind: AttachableKind,
    pub id: Uuid,
}

impl Attachable {
    pub fn new(kind: AttachableKind, id: Uuid) -> Self {
        Self { kind, id }
    }
}

/// Referencia a un blob del Blob Store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRef {
    pub key: String,
    pub filename: String,
    pub byte_size: u64,
    /// sha256 hex del contenido.
    pub checksum: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentFormat {
    Fastq,
    Fasta,
    Genbank,
    Csv,
    Tsv,
    Json,
    Text,
    Unknown,
}

impl AttachmentFormat {
    /// Detecta formato y compresión gzip a partir del nombre de archivo.
    pub fn detect(filename: &str) -> (Self, bool) {
        let lower = filename.to_ascii_lowercase();
        let (stem, compressed) = match lower.strip_suffix(".gz") {
            Some(s) => (s.to_string(), true),
            None => (lower, false),
        };
        let ext = stem.rsplit_once('.').map(|(_, e)| e).unwrap_or("");
        let format = match ext {
            "fastq" | "fq" => Self::Fastq,
            "fasta" | "fa" | "fna" | "ffn" | "faa" => Self::Fasta,
            "gbk" | "gb" | "gbf" | "genbank" => Self::Genbank,
            "csv" => Self::Csv,
            "tsv" => Self::Tsv,
            "json" => Self::Json,
            "txt" | "text" | "log" => Self::Text,
            _ => Self::Unknown,
        };
        (format, compressed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentMetadata {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub format: AttachmentFormat,
    pub compression: Option<String>,
    /// `forward` / `reverse` para lecturas pareadas.
    pub direction: Option<String>,
    pub associated_attachment_id: Option<Uuid>,
}

impl AttachmentMetadata {
    pub fn for_filename(filename: &str) -> Self {
        let (format, compressed) = AttachmentFormat::detect(filename);
        Self { kind: None,
               format,
               compression: compressed.then(|| "gzip".to_string()),
               direction: None,
               associated_attachment_id: None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: Uuid,
    pub attachable: Attachable,
    pub blob: BlobRef,
    pub metadata: AttachmentMetadata,
    pub created_at: DateTime<Utc>,
}

impl Attachment {
    pub fn new(attachable: Attachable, blob: BlobRef, metadata: AttachmentMetadata, now: DateTime<Utc>) -> Self {
        Self { id: Uuid::new_v4(),
               attachable,
               blob,
               metadata,
               created_at: now }
    }

    pub fn filename(&self) -> &str {
        &self.blob.filename
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_format_and_compression() {
        assert_eq!(AttachmentFormat::detect("reads_R1.fastq.gz"), (AttachmentFormat::Fastq, true));
        assert_eq!(AttachmentFormat::detect("contigs.FA"), (AttachmentFormat::Fasta, false));
        assert_eq!(AttachmentFormat::detect("summary.txt.gz"), (AttachmentFormat::Text, true));
        assert_eq!(AttachmentFormat::detect("noext"), (AttachmentFormat::Unknown, false));
    }
}
