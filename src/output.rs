//! Terminal output: phase headers, the retirement table, plan and summary.

use colored::Colorize;
use tabled::settings::Style;
use tabled::{Table, Tabled};

use crate::k8s::NodeInfo;
use crate::upgrade::lifecycle::instance_id_from_provider_id;
use crate::upgrade::orchestrator::Phase;
use crate::upgrade::scaler::CapacityPlan;

/// Row for the retirement snapshot table.
#[derive(Tabled)]
struct RetirementRow {
    #[tabled(rename = "NODE")]
    name: String,
    #[tabled(rename = "VERSION")]
    version: String,
    #[tabled(rename = "INSTANCE")]
    instance: String,
    #[tabled(rename = "STATUS")]
    status: String,
}

/// Prints a phase header in "Phase [current/total]: name" format.
pub fn print_phase(phase: Phase) {
    let Some(index) = phase.step() else {
        return;
    };
    println!();
    println!(
        "{}",
        format!("Phase [{}/{}]: {}", index, Phase::STEPS, phase.title())
            .cyan()
            .bold()
    );
}

/// Print the nodes that will be retired, in retirement order.
pub fn print_retirement_table(nodes: &[NodeInfo], version_prefix: &str) {
    if nodes.is_empty() {
        println!("No nodes with kubelet version {} found.", version_prefix);
        return;
    }

    let rows: Vec<RetirementRow> = nodes
        .iter()
        .map(|n| RetirementRow {
            name: n.name.clone(),
            version: n.kubelet_version.clone(),
            instance: n
                .provider_id
                .as_deref()
                .and_then(instance_id_from_provider_id)
                .unwrap_or_else(|| "-".to_string()),
            status: if n.is_ready() {
                "Ready".green().to_string()
            } else {
                "NotReady".red().to_string()
            },
        })
        .collect();

    println!(
        "{} ({} nodes on {}):",
        "Nodes to retire".bold(),
        nodes.len(),
        version_prefix
    );

    let mut table = Table::new(&rows);
    apply_table_style(&mut table);
    println!("{}", table);
}

/// Print the scale-out the session is about to make.
pub fn print_capacity_plan(group: &str, desired: i32, max_size: i32, plan: &CapacityPlan) {
    println!();
    println!("{} {}", "Auto Scaling group:".bold(), group);
    println!(
        "  DesiredCapacity: {} -> {}",
        desired,
        plan.desired_capacity.to_string().yellow()
    );
    let new_max = plan.effective_max_size(max_size);
    if new_max != max_size {
        println!(
            "  MaxSize:         {} -> {}",
            max_size,
            new_max.to_string().yellow()
        );
    } else {
        println!("  MaxSize:         {} (unchanged)", max_size);
    }
}

/// Print the final summary line.
pub fn print_summary(group: &str, retired: usize, elapsed: chrono::TimeDelta) {
    println!();
    println!(
        "{} Retired {} node(s) in {} ({})",
        "✓".green(),
        retired,
        group.bold(),
        format_duration(elapsed.num_seconds().unsigned_abs())
    );
}

/// Format seconds into a human-readable duration string.
fn format_duration(secs: u64) -> String {
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

fn apply_table_style(table: &mut Table) {
    use tabled::settings::object::Columns;
    use tabled::settings::themes::Theme;
    use tabled::settings::{Modify, Padding};

    let mut theme = Theme::from_style(Style::empty());
    theme.remove_horizontal_lines();
    table.with(theme);
    table.with(Modify::new(Columns::new(..)).with(Padding::new(0, 2, 0, 0)));
}
