use tracing::debug;

use crate::models::AggregateTable;
use crate::sink::{
    Cell, CellRef, CellStyle, Color, FormatRule, FormattingPlan, GridRange, Sink, SinkError,
};
use crate::table;

pub const GAP_HEADER: &str = " ";
pub const TOTAL_LABEL: &str = "Total";
pub const DAY_AVG_LABEL: &str = "Day AVG";

const MIN_SURFACE_ROWS: usize = 120;
const MIN_SURFACE_COLS: usize = 26;
const ROW_HEADROOM: usize = 50;
const COL_HEADROOM: usize = 10;

const GAP_WIDTH_PX: u32 = 40;
const NAME_WIDTH_PX: u32 = 140;
const NUMBER_PATTERN: &str = "#,##0";

const HEADER_FILL: Color = Color::rgb(0.31, 0.51, 0.74);
const HEADER_TEXT: Color = Color::rgb(1.0, 1.0, 1.0);
const BELOW_THRESHOLD_FILL: Color = Color::rgb(1.0, 0.78, 0.81);
const NO_DATA_FILL: Color = Color::rgb(0.75, 0.75, 0.75);
const BAND_LIGHT: Color = Color::rgb(0.86, 0.92, 0.97);
const BAND_VERY_LIGHT: Color = Color::rgb(0.95, 0.97, 0.98);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnRole {
    MemberId,
    MemberName,
    Average,
    Day(i64),
    Gap,
    Total,
}

impl ColumnRole {
    pub fn header(&self) -> String {
        match self {
            ColumnRole::MemberId => "Member_ID".to_string(),
            ColumnRole::MemberName => "Member_Name".to_string(),
            ColumnRole::Average => "AVG/d".to_string(),
            ColumnRole::Day(day) => format!("Day {day}"),
            ColumnRole::Gap => GAP_HEADER.to_string(),
            ColumnRole::Total => TOTAL_LABEL.to_string(),
        }
    }

    fn is_numeric(&self) -> bool {
        matches!(
            self,
            ColumnRole::Average | ColumnRole::Day(_) | ColumnRole::Total
        )
    }
}

/// A table laid out for a surface: member rows plus the two summary rows,
/// with a gap column and a per-row total appended when day columns exist.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedReport {
    pub columns: Vec<ColumnRole>,
    pub data_rows: Vec<Vec<Cell>>,
    pub total_row: Vec<Cell>,
    pub day_avg_row: Vec<Cell>,
}

impl RenderedReport {
    pub fn from_table(table: &AggregateTable) -> Self {
        let mut columns = vec![
            ColumnRole::MemberId,
            ColumnRole::MemberName,
            ColumnRole::Average,
        ];
        columns.extend(table.days.iter().copied().map(ColumnRole::Day));
        if !table.days.is_empty() {
            columns.push(ColumnRole::Gap);
            columns.push(ColumnRole::Total);
        }

        let data_rows: Vec<Vec<Cell>> = table
            .rows
            .iter()
            .map(|row| {
                columns
                    .iter()
                    .map(|role| match role {
                        ColumnRole::MemberId => Cell::text(&row.member_id),
                        ColumnRole::MemberName => Cell::text(&row.member_name),
                        ColumnRole::Average => Cell::Number(row.avg_per_day),
                        ColumnRole::Day(day) => Cell::number(row.value(*day)),
                        ColumnRole::Gap => Cell::Blank,
                        ColumnRole::Total => Cell::number(table::sum_present(
                            table.days.iter().filter_map(|day| row.value(*day)),
                        )),
                    })
                    .collect()
            })
            .collect();

        let column_values = |idx: usize| {
            data_rows
                .iter()
                .filter_map(move |row| row[idx].as_number())
        };

        let total_row = columns
            .iter()
            .enumerate()
            .map(|(idx, role)| match role {
                ColumnRole::MemberName => Cell::text(TOTAL_LABEL),
                ColumnRole::MemberId | ColumnRole::Gap => Cell::Blank,
                _ => Cell::number(table::sum_present(column_values(idx))),
            })
            .collect();

        let day_avg_row = columns
            .iter()
            .enumerate()
            .map(|(idx, role)| match role {
                ColumnRole::MemberName => Cell::text(DAY_AVG_LABEL),
                ColumnRole::Day(_) => {
                    Cell::number(table::mean(column_values(idx)).map(table::round_half_even))
                }
                _ => Cell::Blank,
            })
            .collect();

        Self {
            columns,
            data_rows,
            total_row,
            day_avg_row,
        }
    }

    pub fn header(&self) -> Vec<Cell> {
        self.columns.iter().map(|role| Cell::Text(role.header())).collect()
    }

    /// Header, member rows, `Total`, `Day AVG`, in that order.
    pub fn grid(&self) -> Vec<Vec<Cell>> {
        let mut grid = Vec::with_capacity(self.data_rows.len() + 3);
        grid.push(self.header());
        grid.extend(self.data_rows.iter().cloned());
        grid.push(self.total_row.clone());
        grid.push(self.day_avg_row.clone());
        grid
    }

    pub fn row_count(&self) -> usize {
        self.data_rows.len() + 3
    }

    pub fn col_count(&self) -> usize {
        self.columns.len()
    }

    pub fn surface_size(&self) -> (usize, usize) {
        (
            (self.row_count() + ROW_HEADROOM).max(MIN_SURFACE_ROWS),
            (self.col_count() + COL_HEADROOM).max(MIN_SURFACE_COLS),
        )
    }

    fn column_of(&self, wanted: ColumnRole) -> Option<usize> {
        self.columns.iter().position(|role| *role == wanted)
    }

    fn day_columns(&self) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, role)| matches!(role, ColumnRole::Day(_)))
            .map(|(idx, _)| idx)
            .collect()
    }

    /// Formatting follows column roles and row ranges only; the threshold
    /// and blank-cell rules are the two content-driven exceptions.
    pub fn formatting_plan(&self, threshold: f64) -> FormattingPlan {
        let end_row = self.row_count();
        let end_col = self.col_count();
        let data_end = 1 + self.data_rows.len();
        let has_data = !self.data_rows.is_empty();
        let gap = self.column_of(ColumnRole::Gap);

        let header_style = CellStyle {
            background: Some(HEADER_FILL),
            bold: true,
            foreground: Some(HEADER_TEXT),
            centered: true,
        };
        let summary_style = CellStyle {
            centered: false,
            ..header_style.clone()
        };

        let mut plan = FormattingPlan::new();
        plan.push(FormatRule::BasicFilter {
            range: GridRange::new(0..data_end, 0..end_col),
        })
        .push(FormatRule::Style {
            range: GridRange::new(0..1, 0..end_col),
            style: header_style,
        })
        .push(FormatRule::Style {
            range: GridRange::new(end_row - 2..end_row, 0..end_col),
            style: summary_style,
        });

        if let Some(g) = gap {
            plan.push(FormatRule::Style {
                range: GridRange::new(0..end_row, g..g + 1),
                style: CellStyle {
                    background: Some(HEADER_FILL),
                    ..CellStyle::default()
                },
            })
            .push(FormatRule::ColumnWidth {
                col: g,
                pixels: GAP_WIDTH_PX,
            });
        }

        if has_data {
            let left_end = gap.unwrap_or(end_col);
            let mut bands = vec![GridRange::new(1..data_end, 0..left_end)];
            if let Some(g) = gap {
                bands.push(GridRange::new(1..data_end, g + 1..end_col));
            }
            for range in bands.into_iter().filter(|range| !range.is_empty()) {
                plan.push(FormatRule::Banding {
                    range,
                    first: BAND_LIGHT,
                    second: BAND_VERY_LIGHT,
                });
            }
        }

        for (idx, _) in self
            .columns
            .iter()
            .enumerate()
            .filter(|(_, role)| role.is_numeric())
        {
            plan.push(FormatRule::NumberFormat {
                range: GridRange::new(1..end_row, idx..idx + 1),
                pattern: NUMBER_PATTERN.to_string(),
            });
        }

        let day_ranges: Vec<GridRange> = self
            .day_columns()
            .into_iter()
            .map(|idx| GridRange::new(1..data_end, idx..idx + 1))
            .collect();

        if has_data {
            let mut threshold_ranges = day_ranges.clone();
            if let Some(avg) = self.column_of(ColumnRole::Average) {
                threshold_ranges.push(GridRange::new(1..data_end, avg..avg + 1));
            }
            plan.push(FormatRule::BelowThreshold {
                ranges: threshold_ranges,
                threshold,
                fill: BELOW_THRESHOLD_FILL,
            });

            if !day_ranges.is_empty() {
                plan.push(FormatRule::Blank {
                    ranges: day_ranges,
                    fill: NO_DATA_FILL,
                });
            }
        }

        plan.push(FormatRule::Borders {
            range: GridRange::new(0..end_row, 0..end_col),
        });
        if let Some(name) = self.column_of(ColumnRole::MemberName) {
            plan.push(FormatRule::ColumnWidth {
                col: name,
                pixels: NAME_WIDTH_PX,
            });
        }
        plan.push(FormatRule::FreezeRows { count: 1 });
        plan
    }
}

/// Writes reports onto named surfaces of one spreadsheet.
pub struct ReportRenderer<'a, S: ?Sized> {
    sink: &'a S,
    sheet_id: &'a str,
}

impl<'a, S: Sink + ?Sized> ReportRenderer<'a, S> {
    pub fn new(sink: &'a S, sheet_id: &'a str) -> Self {
        Self { sink, sheet_id }
    }

    /// Replaces any surface called `surface_name` with a freshly written
    /// report. Sink failures are returned as-is; there is no retry here.
    pub async fn render(
        &self,
        table: &AggregateTable,
        surface_name: &str,
        threshold: f64,
    ) -> Result<(), SinkError> {
        let report = RenderedReport::from_table(table);
        let grid = report.grid();
        let plan = report.formatting_plan(threshold);

        let existing = self.sink.list_surfaces(self.sheet_id).await?;
        if existing.iter().any(|name| name == surface_name) {
            debug!(surface = surface_name, "replacing existing surface");
            self.sink.delete_surface(self.sheet_id, surface_name).await?;
        }

        let (rows, cols) = report.surface_size();
        let surface = self
            .sink
            .create_surface(self.sheet_id, surface_name, rows, cols)
            .await?;
        self.sink.write_range(&surface, CellRef::ORIGIN, &grid).await?;
        self.sink.apply_formatting(&surface, &plan).await?;

        debug!(
            surface = surface_name,
            rows = grid.len(),
            cols = report.col_count(),
            rules = plan.len(),
            "report written"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RawActivityRecord;
    use crate::sink::{MemorySink, SurfaceHandle};
    use async_trait::async_trait;

    fn sample_table() -> AggregateTable {
        // Day 2 is only observed for a member who is filtered out.
        table::build(&[
            RawActivityRecord::new("1", "Avery", 1, 10.0),
            RawActivityRecord::new("1", "Avery", 3, 30.0),
            RawActivityRecord::new("2", "Jules", 3, 5.0),
            RawActivityRecord::new("3", "Kiara", 2, 99.0),
        ])
    }

    #[test]
    fn layout_places_gap_before_total() {
        let report = RenderedReport::from_table(&sample_table());
        let headers: Vec<String> = report.columns.iter().map(ColumnRole::header).collect();
        assert_eq!(
            headers,
            vec!["Member_ID", "Member_Name", "AVG/d", "Day 1", "Day 2", "Day 3", " ", "Total"]
        );

        let grid = report.grid();
        assert_eq!(grid.len(), 5);
        assert_eq!(grid[1][1], Cell::text("Avery"));
        assert_eq!(grid[1][7], Cell::Number(40.0));
        assert_eq!(grid[2][1], Cell::text("Jules"));
        assert_eq!(grid[2][3], Cell::Blank);
        assert_eq!(grid[3][1], Cell::text(TOTAL_LABEL));
        assert_eq!(grid[4][1], Cell::text(DAY_AVG_LABEL));
    }

    #[test]
    fn totals_stay_blank_for_columns_without_data() {
        let report = RenderedReport::from_table(&sample_table());
        let total = &report.total_row;
        assert_eq!(total[0], Cell::Blank);
        assert_eq!(total[2], Cell::Number(25.0));
        assert_eq!(total[3], Cell::Number(10.0));
        assert_eq!(total[4], Cell::Blank);
        assert_eq!(total[5], Cell::Number(35.0));
        assert_eq!(total[6], Cell::Blank);
        assert_eq!(total[7], Cell::Number(45.0));

        let day_avg = &report.day_avg_row;
        assert_eq!(day_avg[2], Cell::Blank);
        assert_eq!(day_avg[3], Cell::Number(10.0));
        assert_eq!(day_avg[4], Cell::Blank);
        assert_eq!(day_avg[5], Cell::Number(18.0));
        assert_eq!(day_avg[7], Cell::Blank);
    }

    #[test]
    fn empty_table_has_no_gap_or_total_column() {
        let report = RenderedReport::from_table(&AggregateTable::default());
        assert_eq!(report.col_count(), 3);
        assert_eq!(report.grid().len(), 3);
        assert_eq!(report.surface_size(), (120, 26));

        let plan = report.formatting_plan(100.0);
        assert!(!plan
            .rules()
            .iter()
            .any(|rule| matches!(rule, FormatRule::Banding { .. } | FormatRule::BelowThreshold { .. })));
    }

    #[test]
    fn conditional_rules_cover_member_rows_only() {
        let report = RenderedReport::from_table(&sample_table());
        let plan = report.formatting_plan(20.0);

        let below = plan
            .rules()
            .iter()
            .find_map(|rule| match rule {
                FormatRule::BelowThreshold { ranges, threshold, .. } => Some((ranges, *threshold)),
                _ => None,
            })
            .unwrap();
        assert_eq!(below.1, 20.0);
        assert_eq!(below.0.len(), 4);
        assert!(below.0.iter().all(|r| r.start_row == 1 && r.end_row == 3));
        assert!(below.0.iter().any(|r| r.start_col == 2));

        let blank = plan
            .rules()
            .iter()
            .find_map(|rule| match rule {
                FormatRule::Blank { ranges, .. } => Some(ranges),
                _ => None,
            })
            .unwrap();
        let blank_cols: Vec<usize> = blank.iter().map(|r| r.start_col).collect();
        assert_eq!(blank_cols, vec![3, 4, 5]);
    }

    #[test]
    fn banding_splits_around_gap_column() {
        let report = RenderedReport::from_table(&sample_table());
        let bands: Vec<GridRange> = report
            .formatting_plan(0.0)
            .rules()
            .iter()
            .filter_map(|rule| match rule {
                FormatRule::Banding { range, .. } => Some(*range),
                _ => None,
            })
            .collect();
        assert_eq!(
            bands,
            vec![GridRange::new(1..3, 0..6), GridRange::new(1..3, 7..8)]
        );

        let plan = report.formatting_plan(0.0);
        assert!(plan.rules().contains(&FormatRule::ColumnWidth { col: 6, pixels: 40 }));
        assert!(plan.rules().contains(&FormatRule::ColumnWidth { col: 1, pixels: 140 }));
        assert_eq!(plan.rules().last(), Some(&FormatRule::FreezeRows { count: 1 }));
    }

    #[tokio::test]
    async fn render_replaces_surface_with_identical_content() {
        let sink = MemorySink::new();
        let renderer = ReportRenderer::new(&sink, "book");
        let table = sample_table();

        renderer.render(&table, "ENDLESS (SS)", 20.0).await.unwrap();
        let first = sink.surface("book", "ENDLESS (SS)").unwrap();
        renderer.render(&table, "ENDLESS (SS)", 20.0).await.unwrap();
        let second = sink.surface("book", "ENDLESS (SS)").unwrap();

        assert_eq!(sink.surface_names("book"), vec!["ENDLESS (SS)"]);
        assert_eq!(first.cells, second.cells);
        assert_eq!(second.plans.len(), 1);
        assert_eq!(first.plans, second.plans);
        assert_eq!(second.used_grid(), RenderedReport::from_table(&table).grid());
    }

    #[tokio::test]
    async fn render_replaces_stale_content_entirely() {
        let sink = MemorySink::new();
        let renderer = ReportRenderer::new(&sink, "book");

        let wide = table::build(&[
            RawActivityRecord::new("1", "Avery", 1, 1.0),
            RawActivityRecord::new("2", "Jules", 1, 2.0),
            RawActivityRecord::new("3", "Kiara", 1, 3.0),
        ]);
        renderer.render(&wide, "club", 0.0).await.unwrap();
        renderer.render(&sample_table(), "club", 0.0).await.unwrap();

        let surface = sink.surface("book", "club").unwrap();
        assert_eq!(surface.used_grid().len(), 5);
    }

    struct RejectingSink(MemorySink);

    #[async_trait]
    impl Sink for RejectingSink {
        async fn list_surfaces(&self, sheet_id: &str) -> Result<Vec<String>, SinkError> {
            self.0.list_surfaces(sheet_id).await
        }
        async fn delete_surface(&self, sheet_id: &str, name: &str) -> Result<(), SinkError> {
            self.0.delete_surface(sheet_id, name).await
        }
        async fn create_surface(
            &self,
            sheet_id: &str,
            name: &str,
            rows: usize,
            cols: usize,
        ) -> Result<SurfaceHandle, SinkError> {
            self.0.create_surface(sheet_id, name, rows, cols).await
        }
        async fn write_range(
            &self,
            _surface: &SurfaceHandle,
            _top_left: CellRef,
            _grid: &[Vec<Cell>],
        ) -> Result<(), SinkError> {
            Err(SinkError::Api {
                status: 429,
                body: "quota exceeded".to_string(),
            })
        }
        async fn apply_formatting(
            &self,
            surface: &SurfaceHandle,
            plan: &FormattingPlan,
        ) -> Result<(), SinkError> {
            self.0.apply_formatting(surface, plan).await
        }
        async fn reorder_surfaces(
            &self,
            sheet_id: &str,
            ordered_names: &[String],
        ) -> Result<(), SinkError> {
            self.0.reorder_surfaces(sheet_id, ordered_names).await
        }
    }

    #[tokio::test]
    async fn sink_failures_propagate_without_retry() {
        let sink = RejectingSink(MemorySink::new());
        let renderer = ReportRenderer::new(&sink, "book");
        let result = renderer.render(&sample_table(), "club", 0.0).await;
        assert!(matches!(result, Err(SinkError::Api { status: 429, .. })));
    }
}
