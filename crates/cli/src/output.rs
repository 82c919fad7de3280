//! Output formatting for CLI

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

/// Output format
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    /// Human-readable table format
    #[default]
    Table,
    /// JSON format
    Json,
    /// YAML format
    Yaml,
}

/// Trait for items that can be displayed in a table
pub trait TableDisplay {
    fn headers() -> Vec<&'static str>;
    fn row(&self) -> Vec<String>;
}

/// Print a list of items
pub fn print_list<T: Serialize + TableDisplay>(items: &[T], format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            if items.is_empty() {
                println!("No items found.");
                return;
            }
            println!("{}", render_table(items));
        }
        OutputFormat::Json => print_document(items, format),
        OutputFormat::Yaml => print_document(items, format),
    }
}

/// Print a whole document in a machine-readable format. Tables fall back
/// to JSON.
pub fn print_document<T: Serialize + ?Sized>(value: &T, format: OutputFormat) {
    let rendered = match format {
        OutputFormat::Yaml => serde_yaml::to_string(value).map_err(|e| e.to_string()),
        OutputFormat::Json | OutputFormat::Table => serde_json::to_string_pretty(value).map_err(|e| e.to_string()),
    };
    match rendered {
        Ok(text) => println!("{}", text.trim_end()),
        Err(e) => print_error(&format!("cannot render output: {}", e)),
    }
}

pub fn render_table<T: TableDisplay>(items: &[T]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);

    table.set_header(T::headers());
    for item in items {
        table.add_row(item.row());
    }
    table
}

/// Print success message
pub fn print_success(message: &str) {
    println!("✅ {}", message);
}

/// Print error message
pub fn print_error(message: &str) {
    eprintln!("❌ {}", message);
}

/// Print warning message
pub fn print_warning(message: &str) {
    println!("⚠️  {}", message);
}

/// Print info message
pub fn print_info(message: &str) {
    println!("ℹ️  {}", message);
}
