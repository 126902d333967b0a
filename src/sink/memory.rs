use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Cell, CellRef, FormattingPlan, Sink, SinkError, SurfaceHandle};

#[derive(Debug, Clone, PartialEq)]
pub struct MemorySurface {
    pub surface_id: i64,
    pub name: String,
    pub rows: usize,
    pub cols: usize,
    pub cells: Vec<Vec<Cell>>,
    pub plans: Vec<FormattingPlan>,
}

impl MemorySurface {
    /// The written block: rows and columns trimmed of trailing blanks.
    pub fn used_grid(&self) -> Vec<Vec<Cell>> {
        let used_rows = self
            .cells
            .iter()
            .rposition(|row| row.iter().any(|cell| !cell.is_blank()))
            .map_or(0, |last| last + 1);
        let used_cols = self
            .cells
            .iter()
            .filter_map(|row| row.iter().rposition(|cell| !cell.is_blank()))
            .max()
            .map_or(0, |last| last + 1);

        self.cells[..used_rows]
            .iter()
            .map(|row| row[..used_cols].to_vec())
            .collect()
    }
}

#[derive(Debug, Default)]
struct Workbooks {
    next_id: i64,
    sheets: HashMap<String, Vec<MemorySurface>>,
}

/// Keeps every surface in process. Used for dry runs.
#[derive(Debug, Default)]
pub struct MemorySink {
    state: Mutex<Workbooks>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn surface(&self, sheet_id: &str, name: &str) -> Option<MemorySurface> {
        let state = self.state.lock();
        state
            .sheets
            .get(sheet_id)?
            .iter()
            .find(|surface| surface.name == name)
            .cloned()
    }

    pub fn surface_names(&self, sheet_id: &str) -> Vec<String> {
        let state = self.state.lock();
        state
            .sheets
            .get(sheet_id)
            .map(|surfaces| surfaces.iter().map(|s| s.name.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn list_surfaces(&self, sheet_id: &str) -> Result<Vec<String>, SinkError> {
        Ok(self.surface_names(sheet_id))
    }

    async fn delete_surface(&self, sheet_id: &str, name: &str) -> Result<(), SinkError> {
        let mut state = self.state.lock();
        let surfaces = state.sheets.entry(sheet_id.to_string()).or_default();
        let before = surfaces.len();
        surfaces.retain(|surface| surface.name != name);
        if surfaces.len() == before {
            return Err(SinkError::SurfaceNotFound(name.to_string()));
        }
        Ok(())
    }

    async fn create_surface(
        &self,
        sheet_id: &str,
        name: &str,
        rows: usize,
        cols: usize,
    ) -> Result<SurfaceHandle, SinkError> {
        let mut state = self.state.lock();
        state.next_id += 1;
        let surface_id = state.next_id;
        let surfaces = state.sheets.entry(sheet_id.to_string()).or_default();
        if surfaces.iter().any(|surface| surface.name == name) {
            return Err(SinkError::Api {
                status: 400,
                body: format!("a surface named {name:?} already exists"),
            });
        }
        surfaces.push(MemorySurface {
            surface_id,
            name: name.to_string(),
            rows,
            cols,
            cells: vec![vec![Cell::Blank; cols]; rows],
            plans: Vec::new(),
        });

        Ok(SurfaceHandle {
            sheet_id: sheet_id.to_string(),
            surface_id,
            name: name.to_string(),
        })
    }

    async fn write_range(
        &self,
        surface: &SurfaceHandle,
        top_left: CellRef,
        grid: &[Vec<Cell>],
    ) -> Result<(), SinkError> {
        let mut state = self.state.lock();
        let target = find_mut(&mut state, surface)?;

        // Nothing is written unless the whole block fits.
        let height = grid.len();
        let width = grid.iter().map(Vec::len).max().unwrap_or(0);
        if height > 0 && width > 0 {
            let (last_row, last_col) = (top_left.row + height - 1, top_left.col + width - 1);
            if last_row >= target.rows || last_col >= target.cols {
                return Err(SinkError::Api {
                    status: 400,
                    body: format!("cell ({last_row}, {last_col}) exceeds grid limits"),
                });
            }
        }

        for (r, row) in grid.iter().enumerate() {
            for (c, cell) in row.iter().enumerate() {
                target.cells[top_left.row + r][top_left.col + c] = cell.clone();
            }
        }
        Ok(())
    }

    async fn apply_formatting(
        &self,
        surface: &SurfaceHandle,
        plan: &FormattingPlan,
    ) -> Result<(), SinkError> {
        let mut state = self.state.lock();
        find_mut(&mut state, surface)?.plans.push(plan.clone());
        Ok(())
    }

    async fn reorder_surfaces(
        &self,
        sheet_id: &str,
        ordered_names: &[String],
    ) -> Result<(), SinkError> {
        let mut state = self.state.lock();
        let surfaces = state.sheets.entry(sheet_id.to_string()).or_default();
        let rank = |name: &str| {
            ordered_names
                .iter()
                .position(|ordered| ordered == name)
                .unwrap_or(ordered_names.len())
        };
        surfaces.sort_by_key(|surface| rank(&surface.name));
        Ok(())
    }
}

fn find_mut<'a>(
    state: &'a mut Workbooks,
    surface: &SurfaceHandle,
) -> Result<&'a mut MemorySurface, SinkError> {
    state
        .sheets
        .get_mut(&surface.sheet_id)
        .and_then(|surfaces| {
            surfaces
                .iter_mut()
                .find(|candidate| candidate.surface_id == surface.surface_id)
        })
        .ok_or_else(|| SinkError::SurfaceNotFound(surface.name.clone()))
}
