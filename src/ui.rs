//! Interface de terminal do dialectic: spinners e saída colorida.
//!
//! Usa as crates `indicatif` para spinners de progresso e `console` para
//! estilização com cores. O [`StageProgress`] acompanha visualmente
//! a execução de um estágio no terminal.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::progression::SessionDetails;
use crate::recipe::RecipeBook;
use crate::session::SessionStatus;
use crate::state_machine::JobStatus;
use crate::worker::PoolReport;

/// Indicador visual de progresso para a execução de um estágio no terminal.
///
/// Exibe um spinner animado durante o processamento e mensagens
/// coloridas para sucesso (verde) e falha (vermelho).
pub struct StageProgress {
    // Barra de progresso/spinner do indicatif.
    pb: ProgressBar,
    green: Style,
    red: Style,
}

impl StageProgress {
    /// Inicia o spinner com a descrição do estágio.
    pub fn start(description: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            pb.set_style(style);
        }
        pb.set_message(description.to_string());
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
        }
    }

    /// Finaliza o spinner e exibe o resultado do estágio.
    pub fn complete(&self, report: &PoolReport, status: SessionStatus) {
        self.pb.finish_and_clear();
        if report.failed == 0 {
            println!(
                "  {} {} job steps processed, session is now {status}",
                self.green.apply_to("✓"),
                report.steps
            );
        } else {
            println!(
                "  {} {} of {} job steps failed, session is {status}",
                self.red.apply_to("✗"),
                report.failed,
                report.steps
            );
        }
    }

    pub fn abort(&self, message: &str) {
        self.pb.finish_and_clear();
        println!("  {} {message}", self.red.apply_to("✗"));
    }
}

/// Imprime os detalhes da sessão formatados em JSON com estilo colorido.
pub fn print_details(details: &SessionDetails) {
    let failed = details.jobs.iter().any(|j| j.status.is_failure());
    let done = details
        .jobs
        .iter()
        .all(|j| j.status == JobStatus::Completed);
    let style = if failed {
        Style::new().red().bold()
    } else if done {
        Style::new().green().bold()
    } else {
        Style::new().yellow()
    };
    println!(
        "{}",
        style.apply_to(format!("─── Session {} ───", details.session.status))
    );
    println!(
        "{}",
        serde_json::to_string_pretty(details).unwrap_or_default()
    );
}

pub fn print_recipes(book: &RecipeBook) {
    let bold = Style::new().bold();
    let dim = Style::new().dim();
    for recipe in &book.recipes {
        println!("{}", bold.apply_to(recipe.stage));
        for step in &recipe.steps {
            println!(
                "  {} {}",
                step.step_slug,
                dim.apply_to(format!(
                    "-> {} ({:?})",
                    step.outputs_required.document_key, step.outputs_required.artifact_class
                ))
            );
        }
    }
}
