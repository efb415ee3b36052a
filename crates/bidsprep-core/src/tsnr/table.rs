use crate::error::Error;
use crate::fsutil;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TsnrRow {
    pub preproc: String,
    pub postproc: String,
    pub mean: f64,
    pub std: f64,
}

/// Persisted `preproc,postproc,mean,std` table.
#[derive(Debug, Clone)]
pub struct ResultTable {
    path: PathBuf,
    rows: Vec<TsnrRow>,
}

impl ResultTable {
    pub fn empty(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            rows: Vec::new(),
        }
    }

    /// Read the table at `path`, or start an empty one if there is none.
    pub fn load(path: &Path) -> Result<Self, Error> {
        if !path.is_file() {
            return Ok(Self::empty(path));
        }
        let mut reader = csv::Reader::from_path(path)?;
        let rows = reader
            .deserialize()
            .collect::<Result<Vec<TsnrRow>, csv::Error>>()?;
        Ok(Self {
            path: path.to_path_buf(),
            rows,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows(&self) -> &[TsnrRow] {
        &self.rows
    }

    pub fn contains(&self, preproc: &str, postproc: &str) -> bool {
        self.rows
            .iter()
            .any(|row| row.preproc == preproc && row.postproc == postproc)
    }

    pub fn push(&mut self, row: TsnrRow) {
        self.rows.push(row);
    }

    /// Rewrite the whole table through a temp file.
    pub fn save(&self) -> Result<(), Error> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        for row in &self.rows {
            writer.serialize(row)?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| Error::Other(format!("cannot flush result table: {}", e)))?;
        let bytes = if self.rows.is_empty() {
            b"preproc,postproc,mean,std\n".to_vec()
        } else {
            bytes
        };
        fsutil::write_atomic(&self.path, &bytes)?;
        Ok(())
    }

    /// Column-aligned plain text, numbers right-aligned.
    pub fn render_text(&self) -> String {
        let header = ["preproc", "postproc", "mean", "std"];
        let cells: Vec<[String; 4]> = self
            .rows
            .iter()
            .map(|row| {
                [
                    row.preproc.clone(),
                    row.postproc.clone(),
                    format!("{:.4}", row.mean),
                    format!("{:.4}", row.std),
                ]
            })
            .collect();

        let mut widths = header.map(str::len);
        for row in &cells {
            for (width, cell) in widths.iter_mut().zip(row.iter()) {
                *width = (*width).max(cell.len());
            }
        }

        let line = |cols: [&str; 4]| -> String {
            format!(
                "{:<w0$}  {:<w1$}  {:>w2$}  {:>w3$}",
                cols[0],
                cols[1],
                cols[2],
                cols[3],
                w0 = widths[0],
                w1 = widths[1],
                w2 = widths[2],
                w3 = widths[3]
            )
            .trim_end()
            .to_string()
        };

        let mut out = String::new();
        out.push_str(&line(header));
        out.push('\n');
        let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
        out.push_str(&rule.join("  "));
        out.push('\n');
        for row in &cells {
            out.push_str(&line([&row[0], &row[1], &row[2], &row[3]]));
            out.push('\n');
        }
        out
    }

    /// Write [`render_text`](Self::render_text) next to the table as `.txt`.
    pub fn save_text(&self) -> Result<PathBuf, Error> {
        let path = self.path.with_extension("txt");
        fsutil::write_atomic(&path, self.render_text().as_bytes())?;
        Ok(path)
    }
}
