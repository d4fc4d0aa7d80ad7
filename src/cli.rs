//! Interface de linha de comando do WorkHero baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (serve, worker,
//! init-db, exec) e flags globais (--config, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// WorkHero: broker de tarefas de IA pagas e com tempo limitado.
#[derive(Debug, Parser)]
#[command(name = "workhero", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Arquivo de configuração TOML (padrão: `workhero.toml`, se existir).
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Sobe a API HTTP.
    Serve,

    /// Processa itens pagos da fila.
    Worker {
        /// Faz uma única varredura e sai.
        #[arg(long, default_value_t = false)]
        once: bool,

        /// Mostra um spinner enquanto o agente trabalha.
        #[arg(long, default_value_t = false)]
        progress: bool,

        /// Usa o banco diretamente em vez da API do broker.
        #[arg(long, default_value_t = false)]
        local: bool,
    },

    /// Cria as tabelas e índices do banco.
    InitDb,

    /// Executa uma tarefa localmente, sem pagamento nem fila.
    Exec {
        /// Orçamento em minutos (aceita frações).
        #[arg(long, short, default_value_t = 5.0, value_parser = parse_minutes)]
        minutes: f64,

        /// Diretório de trabalho do agente.
        #[arg(long, short, default_value = ".")]
        dir: PathBuf,

        /// Descrição da tarefa.
        task: String,
    },
}

/// Aceita apenas orçamentos finitos e positivos, de até um dia.
fn parse_minutes(value: &str) -> Result<f64, String> {
    let minutes: f64 = value
        .parse()
        .map_err(|_| format!("`{value}` is not a number"))?;
    if minutes.is_finite() && minutes > 0.0 && minutes <= MAX_EXEC_MINUTES {
        Ok(minutes)
    } else {
        Err(format!("minutes must be greater than 0 and at most {MAX_EXEC_MINUTES}"))
    }
}

const MAX_EXEC_MINUTES: f64 = 24.0 * 60.0;
