//! `stepwise tools` — list the built-in tools.

pub fn list() -> anyhow::Result<()> {
    let registry = stepwise_tools::default_registry();

    println!();
    println!("  Available tools ({}):", registry.len());
    for tool in registry.iter() {
        println!();
        println!("  {}", tool.name());
        println!("    {}", tool.description());
        let schema = serde_json::to_string_pretty(&tool.input_schema())?;
        for line in schema.lines() {
            println!("    {line}");
        }
    }
    println!();
    Ok(())
}
