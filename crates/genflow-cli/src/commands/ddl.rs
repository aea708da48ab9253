//! `genflow ddl` command implementation

use genflow_core::Model;

use crate::error::Result;

pub fn run(model: &Model) -> Result<()> {
    for statement in model.ddl() {
        println!("{};\n", statement);
    }
    Ok(())
}
