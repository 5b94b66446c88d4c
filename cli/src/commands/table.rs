use colored::Colorize;
use stepwise_core::{transition_table, WorkflowState};

/// Print every legal transition grouped by source state.
pub fn execute() {
    let table = transition_table();

    for state in WorkflowState::ALL {
        let rows: Vec<_> = table.iter().filter(|(from, _, _)| *from == state).collect();
        if rows.is_empty() {
            continue;
        }

        println!("{}", state.as_str().cyan().bold());
        for (_, event, to) in rows {
            println!("  {:<28} -> {}", event.as_str(), to);
        }
    }
}
