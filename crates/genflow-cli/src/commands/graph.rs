//! `genflow graph` command implementation

use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Table};
use genflow_core::Model;

use crate::error::Result;

/// Print generators in run order with the generators they depend on
pub fn run(model: &Model) -> Result<()> {
    println!("{}", graph_table(model));
    Ok(())
}

fn graph_table(model: &Model) -> Table {
    let graph = model.graph();
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec!["#", "Generator", "Depends on", "Tags"]);

    for (position, &index) in graph.order().iter().enumerate() {
        let name = graph.name(index);
        let upstream = graph
            .upstream(index)
            .iter()
            .map(|&u| graph.name(u))
            .collect::<Vec<_>>()
            .join(", ");
        let tags = model.generator(name).map(|g| g.tags.join(", ")).unwrap_or_default();
        table.add_row(vec![
            (position + 1).to_string(),
            name.to_string(),
            if upstream.is_empty() { "-".to_string() } else { upstream },
            tags,
        ]);
    }
    table
}
