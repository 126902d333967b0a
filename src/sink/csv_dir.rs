use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use super::{Cell, CellRef, FormattingPlan, Sink, SinkError, SurfaceHandle};

const EXTENSION: &str = "csv";

/// Writes each surface to `<dir>/<percent-encoded surface>.csv`. Formatting
/// is not representable in CSV and is dropped.
#[derive(Debug, Clone)]
pub struct CsvDirSink {
    dir: PathBuf,
}

impl CsvDirSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.{EXTENSION}", file_stem(name)))
    }
}

/// Reversible: distinct surface names never share a file.
fn file_stem(name: &str) -> String {
    urlencoding::encode(name).into_owned()
}

fn surface_name(stem: &str) -> Option<String> {
    urlencoding::decode(stem).ok().map(|name| name.into_owned())
}

fn parse_grid(raw: &[u8]) -> Result<Vec<Vec<String>>, SinkError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(raw);
    let mut grid = Vec::new();
    for record in reader.records() {
        grid.push(record?.iter().map(str::to_string).collect());
    }
    Ok(grid)
}

fn encode_grid(grid: &[Vec<String>]) -> Result<Vec<u8>, SinkError> {
    let mut writer = csv::WriterBuilder::new().flexible(true).from_writer(Vec::new());
    for row in grid {
        writer.write_record(row)?;
    }
    writer.into_inner().map_err(|e| {
        SinkError::Io(std::io::Error::new(e.error().kind(), e.error().to_string()))
    })
}

#[async_trait]
impl Sink for CsvDirSink {
    async fn list_surfaces(&self, _sheet_id: &str) -> Result<Vec<String>, SinkError> {
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(names),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(EXTENSION) {
                continue;
            }
            if let Some(name) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(surface_name)
            {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    async fn delete_surface(&self, _sheet_id: &str, name: &str) -> Result<(), SinkError> {
        match tokio::fs::remove_file(self.path_for(name)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(SinkError::SurfaceNotFound(name.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn create_surface(
        &self,
        sheet_id: &str,
        name: &str,
        _rows: usize,
        _cols: usize,
    ) -> Result<SurfaceHandle, SinkError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(self.path_for(name), b"").await?;
        Ok(SurfaceHandle {
            sheet_id: sheet_id.to_string(),
            surface_id: 0,
            name: name.to_string(),
        })
    }

    async fn write_range(
        &self,
        surface: &SurfaceHandle,
        top_left: CellRef,
        grid: &[Vec<Cell>],
    ) -> Result<(), SinkError> {
        let path = self.path_for(&surface.name);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(SinkError::SurfaceNotFound(surface.name.clone()))
            }
            Err(err) => return Err(err.into()),
        };

        let mut existing = parse_grid(&raw)?;
        for (r, row) in grid.iter().enumerate() {
            let row_idx = top_left.row + r;
            if existing.len() <= row_idx {
                existing.resize(row_idx + 1, Vec::new());
            }
            let target = &mut existing[row_idx];
            for (c, cell) in row.iter().enumerate() {
                let col_idx = top_left.col + c;
                if target.len() <= col_idx {
                    target.resize(col_idx + 1, String::new());
                }
                target[col_idx] = cell.to_string();
            }
        }
        tokio::fs::write(&path, encode_grid(&existing)?).await?;
        Ok(())
    }

    async fn apply_formatting(
        &self,
        surface: &SurfaceHandle,
        plan: &FormattingPlan,
    ) -> Result<(), SinkError> {
        debug!(surface = %surface.name, rules = plan.len(), "csv sink ignores formatting");
        Ok(())
    }

    async fn reorder_surfaces(
        &self,
        _sheet_id: &str,
        _ordered_names: &[String],
    ) -> Result<(), SinkError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RawActivityRecord;
    use crate::report::ReportRenderer;
    use crate::table;

    #[tokio::test]
    async fn surfaces_round_trip_through_files() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvDirSink::new(dir.path().join("out"));

        assert!(sink.list_surfaces("book").await.unwrap().is_empty());

        let surface = sink.create_surface("book", "ENDLESS (SS)", 10, 10).await.unwrap();
        sink.write_range(
            &surface,
            CellRef::ORIGIN,
            &[
                vec![Cell::text("Member_Name"), Cell::text("Total")],
                vec![Cell::text("Avery"), Cell::Number(1500.0)],
                vec![Cell::text("Jules"), Cell::Blank],
            ],
        )
        .await
        .unwrap();

        let written = std::fs::read_to_string(dir.path().join("out/ENDLESS%20%28SS%29.csv")).unwrap();
        assert_eq!(written, "Member_Name,Total\nAvery,1500\nJules,\n");
        assert_eq!(
            sink.list_surfaces("book").await.unwrap(),
            vec!["ENDLESS (SS)".to_string()]
        );

        sink.delete_surface("book", "ENDLESS (SS)").await.unwrap();
        assert!(sink.list_surfaces("book").await.unwrap().is_empty());
    }

    #[test]
    fn file_names_round_trip_to_surface_names() {
        for name in ["ENDLESS A/B", "ENDLESS A:B", "ENDLESS A_B", "100% (SS)", "エンドレス"] {
            assert_eq!(surface_name(&file_stem(name)).as_deref(), Some(name));
        }
        assert_eq!(file_stem("A/B"), "A%2FB");
    }

    #[tokio::test]
    async fn titles_differing_only_in_unsafe_characters_keep_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvDirSink::new(dir.path());
        let renderer = ReportRenderer::new(&sink, "book");

        let avery = table::build(&[RawActivityRecord::new("1", "Avery", 1, 10.0)]);
        let jules = table::build(&[RawActivityRecord::new("2", "Jules", 1, 20.0)]);
        renderer.render(&avery, "ENDLESS A/B", 5.0).await.unwrap();
        renderer.render(&jules, "ENDLESS A:B", 5.0).await.unwrap();

        assert_eq!(
            sink.list_surfaces("book").await.unwrap(),
            vec!["ENDLESS A/B".to_string(), "ENDLESS A:B".to_string()]
        );
        let first = std::fs::read_to_string(sink.path_for("ENDLESS A/B")).unwrap();
        let second = std::fs::read_to_string(sink.path_for("ENDLESS A:B")).unwrap();
        assert!(first.contains("Avery") && !first.contains("Jules"));
        assert!(second.contains("Jules") && !second.contains("Avery"));

        // Re-rendering finds the existing surface under its original title.
        renderer.render(&jules, "ENDLESS A/B", 5.0).await.unwrap();
        assert_eq!(sink.list_surfaces("book").await.unwrap().len(), 2);
        let replaced = std::fs::read_to_string(sink.path_for("ENDLESS A/B")).unwrap();
        assert!(replaced.contains("Jules") && !replaced.contains("Avery"));
    }
}
