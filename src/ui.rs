//! Interface de terminal do WorkHero: spinners e saída colorida.
//!
//! Usa as crates `indicatif` para spinners de progresso e `console` para
//! estilização com cores. O [`ExecutionProgress`] acompanha visualmente
//! a execução de um item de trabalho no terminal.

use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::state_machine::ExecutionResult;
use crate::supervisor::ExecutionEvent;

/// Indicador visual de progresso para a execução de um item.
///
/// Exibe um spinner com a ferramenta em uso pelo agente e mensagens
/// coloridas para sucesso (verde) e falha (vermelho).
pub struct ExecutionProgress {
    // Spinner do indicatif.
    pb: ProgressBar,
    // Prefixo fixo com o id do item e o orçamento.
    label: String,
    green: Style,
    red: Style,
    dim: Style,
}

impl ExecutionProgress {
    /// Inicia o spinner para o item `id` com orçamento de `minutes` minutos.
    pub fn start(id: i64, minutes: u32) -> Self {
        let pb = ProgressBar::new_spinner();
        // O template é constante; se falhar, fica o estilo padrão.
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} [{elapsed}] {msg}") {
            pb.set_style(style);
        }
        let label = format!("task #{id} ({minutes} min)");
        pb.set_message(format!("{label}: starting"));
        pb.enable_steady_tick(Duration::from_millis(100));

        Self {
            pb,
            label,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            dim: Style::new().dim(),
        }
    }

    /// Atualiza a mensagem do spinner a partir de um evento do agente.
    pub fn event(&self, event: &ExecutionEvent) {
        match event {
            ExecutionEvent::Started { model, .. } => {
                let model = model.as_deref().unwrap_or("agent");
                self.pb.set_message(format!("{}: {model} running", self.label));
            }
            ExecutionEvent::ToolUse(name) => {
                self.pb.set_message(format!("{}: {name}", self.label));
            }
            ExecutionEvent::Thinking(_) => {
                self.pb.set_message(format!("{}: thinking", self.label));
            }
            ExecutionEvent::Text(text) => {
                let first = text.lines().next().unwrap_or_default();
                self.pb.println(format!("  {}", self.dim.apply_to(first)));
            }
            ExecutionEvent::Finished { .. } | ExecutionEvent::Log(_) => {}
        }
    }

    /// Finaliza o spinner e exibe o resultado da execução.
    pub fn finish(&self, result: &ExecutionResult) {
        self.pb.finish_and_clear();
        if result.success {
            println!("  {} {} completed", self.green.apply_to("✓"), self.label);
        } else {
            let reason = result.error.as_deref().unwrap_or("no error output");
            println!("  {} {} failed: {reason}", self.red.apply_to("✗"), self.label);
        }
    }
}
