//! Plan-chunks command implementation.

use super::CliResult;
use outpost_core::{ChunkPlanner, NumericChunkPlanner, RecordType, TickWindow, NEVER_SYNCED};
use outpost_testkit::SyntheticIdSpace;
use serde::Serialize;

/// One planned range.
#[derive(Debug, Serialize)]
pub struct PlannedRange {
    /// First id in the range.
    pub from: String,
    /// End of the range (exclusive for string ids, inclusive for numeric ids).
    pub to: Option<String>,
    /// Rows in the range.
    pub rows: usize,
}

/// Chunk planning result.
#[derive(Debug, Serialize)]
pub struct PlanResult {
    /// Planner used (`prefix` or `numeric`).
    pub planner: &'static str,
    /// Rows planned over.
    pub rows: usize,
    /// Configured rows-per-chunk limit.
    pub chunk_size: usize,
    /// Number of ranges.
    pub chunks: usize,
    /// Rows in the largest range.
    pub largest: usize,
    /// The ranges, in id order.
    pub ranges: Vec<PlannedRange>,
}

/// Plans `rows` dense ids into chunks of at most `chunk_size` rows.
pub fn plan(rows: usize, chunk_size: usize, numeric: bool) -> CliResult<PlanResult> {
    let ranges = if numeric {
        plan_numeric(rows, chunk_size)?
    } else {
        plan_prefix(rows, chunk_size)?
    };
    Ok(PlanResult {
        planner: if numeric { "numeric" } else { "prefix" },
        rows,
        chunk_size,
        chunks: ranges.len(),
        largest: ranges.iter().map(|r| r.rows).max().unwrap_or(0),
        ranges,
    })
}

fn plan_numeric(rows: usize, chunk_size: usize) -> CliResult<Vec<PlannedRange>> {
    let planner = NumericChunkPlanner::new(chunk_size)?;
    if rows == 0 {
        return Ok(Vec::new());
    }
    let ranges = planner.plan(0, rows as u64 - 1, |start, end| Ok((end - start + 1) as usize))?;
    Ok(ranges
        .into_iter()
        .map(|(range, rows)| PlannedRange {
            from: range.start.to_string(),
            to: Some(range.end.to_string()),
            rows,
        })
        .collect())
}

fn plan_prefix(rows: usize, chunk_size: usize) -> CliResult<Vec<PlannedRange>> {
    let planner = ChunkPlanner::new(chunk_size)?;
    let width = rows.saturating_sub(1).to_string().len();
    let space = SyntheticIdSpace::dense(rows, width);
    let plan = planner.plan(&space, &RecordType::from("synthetic"), TickWindow::after(NEVER_SYNCED))?;
    Ok(plan
        .chunks
        .into_iter()
        .map(|chunk| PlannedRange {
            from: chunk.range.from_id.map(|id| id.as_str().to_owned()).unwrap_or_default(),
            to: chunk.range.to_id.map(|id| id.as_str().to_owned()),
            rows: chunk.count,
        })
        .collect())
}

/// Runs the plan-chunks command.
pub fn run(rows: usize, chunk_size: usize, numeric: bool, limit: Option<usize>, format: &str) -> CliResult<()> {
    let mut result = plan(rows, chunk_size, numeric)?;
    if let Some(limit) = limit {
        result.ranges.truncate(limit);
    }

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }
    Ok(())
}

fn print_text_output(result: &PlanResult) {
    println!("Outpost Chunk Plan");
    println!("==================");
    println!();
    println!("Planner:    {}", result.planner);
    println!("Rows:       {}", result.rows);
    println!("Chunk size: {}", result.chunk_size);
    println!("Chunks:     {}", result.chunks);
    println!("Largest:    {} rows", result.largest);
    println!();
    for (i, range) in result.ranges.iter().enumerate() {
        let to = range.to.as_deref().unwrap_or("end");
        println!("  [{i:>4}] {} .. {}  ({} rows)", range.from, to, range.rows);
    }
    if result.ranges.len() < result.chunks {
        println!("  ... {} more", result.chunks - result.ranges.len());
    }
}


