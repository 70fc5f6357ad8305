use crate::utils::config::{REGION_FORMAT_VERSION, REPORT_SCHEMA_VERSION, STATEMENTS_PER_CHUNK};

/// Display schema information
pub fn display_schema(show_details: bool) {
    println!("plprofiler Report Schema");
    println!("Current Version: {}", REPORT_SCHEMA_VERSION);
    println!("Region Format:   {}", REGION_FORMAT_VERSION);
    println!();

    if show_details {
        println!("Report Structure:");
        println!("  version: string           - Schema version (e.g., '1.0.0')");
        println!("  generated_at: string      - ISO 8601 timestamp");
        println!("  unit_id: number           - Procedure object id");
        println!("  name: string              - Procedure name");
        println!("  statements: array         - One row per visible statement");
        println!("    natural_id: number      - Source-order statement id");
        println!("    parent_natural_id: number? - Enclosing statement");
        println!("    block_label: string?    - Parent list ('then body', 'elsif 1', ...)");
        println!("    block_num: number       - Position in that list");
        println!("    exec_count: number      - Executions");
        println!("    exec_count_err: number  - Executions that ended with an error");
        println!("    total_time_us: number   - Self time in microseconds");
        println!("    max_time_us: number     - Longest single execution");
        println!("    rows: number            - Rows processed");
        println!("  lines: array?             - Per source line totals");
        println!("  coverage: object          - Statement and branch coverage");
        println!("  summary: object?          - Call count, mean, stddev, min, max");
        println!();
        println!("Region chunks hold {} statement records each.", STATEMENTS_PER_CHUNK);
    } else {
        println!("Use --show for detailed schema information");
    }
}

/// Display version information
pub fn display_version() {
    println!("plprofiler v{}", env!("CARGO_PKG_VERSION"));
    println!("Report Schema: v{}", REPORT_SCHEMA_VERSION);
    println!("Region Format: v{}", REGION_FORMAT_VERSION);
    println!();
    println!("Per-statement execution profiler and coverage engine for procedural code.");
}
