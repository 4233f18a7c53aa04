use clap::Parser;
use rand::SeedableRng;
use rand::rngs::StdRng;
use trim_planner::optimizer::{SearchOutcome, SearchParams, TrimOptimizer};
use trim_planner::types::{OrderLine, OrderSet, TrimPlan};

#[derive(Parser)]
#[command(
    name = "trim_planner",
    about = "Randomized two-stage trim plan search for one order set"
)]
struct Cli {
    /// Order lines as width:qty (e.g. 150:10 162:10)
    #[arg(long = "orders", num_args = 1..)]
    orders: Vec<String>,

    /// Stage target width in width-units, applied to both stages
    #[arg(long, default_value_t = 312)]
    stage_width: u32,

    /// Kerf tolerance below the target still accepted (width-units)
    #[arg(long, default_value_t = 12)]
    tolerance: u32,

    /// Iteration budget for the search
    #[arg(long, default_value_t = 30000)]
    iterations: u32,

    /// Seed for reproducible output (unseeded by default)
    #[arg(long)]
    seed: Option<u64>,
}

fn parse_order(s: &str) -> Result<OrderLine, String> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 2 {
        return Err(format!("invalid order '{}', expected width:qty", s));
    }
    let width = parts[0]
        .parse::<u32>()
        .map_err(|_| format!("invalid width in '{}'", s))?;
    let quantity = parts[1]
        .parse::<u32>()
        .map_err(|_| format!("invalid quantity in '{}'", s))?;
    if width == 0 {
        return Err(format!("width must be non-zero in '{}'", s));
    }
    Ok(OrderLine { width, quantity })
}

fn main() {
    let cli = Cli::parse();

    let lines: Vec<OrderLine> = cli
        .orders
        .iter()
        .map(|o| parse_order(o))
        .collect::<Result<Vec<_>, _>>()
        .unwrap_or_else(|e| {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        });
    if lines.is_empty() {
        eprintln!("Error: no orders given");
        std::process::exit(1);
    }

    let orders = OrderSet::new(lines);
    let mut params = SearchParams::with_stage_width(cli.stage_width);
    params.tolerance = cli.tolerance;
    params.iteration_cap = cli.iterations;

    let optimizer = TrimOptimizer::new(&orders, params);
    let outcome = match cli.seed {
        Some(seed) => optimizer.search(&mut StdRng::seed_from_u64(seed), || false),
        None => optimizer.search(&mut rand::rng(), || false),
    };

    match outcome {
        SearchOutcome::Plan(plan) => print_plan(&plan),
        // Unreachable with a never-stopping predicate, but don't hide it.
        SearchOutcome::Interrupted => {
            eprintln!("Error: search interrupted");
            std::process::exit(1);
        }
    }
}

fn print_plan(plan: &TrimPlan) {
    println!(
        "{:>7} {:>8} {:>8} {:>7} {:>8} {:>7}",
        "Width", "Ordered", "Stage1", "Rem1", "Stage2", "Rem2"
    );
    for r in &plan.residuals {
        println!(
            "{:>7} {:>8} {:>8} {:>7} {:>8} {:>7}",
            r.width,
            r.original,
            r.consumed_stage1,
            r.residual_stage1,
            r.consumed_stage2,
            r.residual_stage2
        );
    }

    println!();
    println!("Trim actions:");
    for a in &plan.actions {
        match (a.width_c, a.qty_c) {
            (Some(wc), Some(qc)) => println!(
                "  {} x{} + {} x{} + {} x{}",
                a.width_a, a.qty_a, a.width_b, a.qty_b, wc, qc
            ),
            _ => println!("  {} x{} + {} x{}", a.width_a, a.qty_a, a.width_b, a.qty_b),
        }
    }

    println!();
    println!(
        "Summary: {:.3} t leftover, {} stage-1 cuts, {} action{}",
        plan.leftover_weight,
        plan.stage1_pair_count,
        plan.actions.len(),
        if plan.actions.len() == 1 { "" } else { "s" },
    );
}
