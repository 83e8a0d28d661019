//! Interface de linha de comando do dialectic baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (init, generate,
//! resume, status, recipes, fail-job) e flags globais (--state, --max-retries,
//! --workers, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use uuid::Uuid;

/// dialectic: orquestrador de geração em estágios com múltiplos modelos.
#[derive(Debug, Parser)]
#[command(name = "dialectic", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Arquivo de estado (sobrepõe `state_path` do dialectic.toml).
    #[arg(long, global = true)]
    pub state: Option<PathBuf>,

    /// Número máximo de tentativas por job (mínimo 1).
    #[arg(long, global = true, value_parser = clap::value_parser!(u32).range(1..))]
    pub max_retries: Option<u32>,

    /// Número de workers concorrentes.
    #[arg(long, global = true)]
    pub workers: Option<usize>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Cria um projeto e a sua sessão, pronta para o estágio thesis.
    Init {
        /// Nome do projeto.
        #[arg(long)]
        name: String,

        /// Descrição inicial do que deve ser planejado.
        #[arg(long)]
        prompt: String,

        /// Modelos participantes (repetível).
        #[arg(long = "model", default_values_t = vec!["claude-sonnet".to_string()])]
        models: Vec<String>,

        /// Dono do projeto.
        #[arg(long, default_value = "local")]
        owner: String,
    },

    /// Planeja o estágio atual da sessão e processa os jobs até esvaziar a fila.
    Generate {
        /// Sessão alvo; sem valor usa a sessão mais recente.
        #[arg(long)]
        session: Option<Uuid>,

        #[arg(long, default_value = "local-wallet")]
        wallet: String,

        #[arg(long, default_value = "local")]
        auth_token: String,

        /// Usa o modelo stub em vez do provedor real.
        #[arg(long, default_value_t = false)]
        test: bool,

        /// Não pede continuação quando a resposta vem truncada.
        #[arg(long, default_value_t = false)]
        no_continue: bool,
    },

    /// Retoma jobs pendentes sem planejar: recupera jobs presos em
    /// `processing` por um worker interrompido e processa a fila.
    Resume {
        /// Sessão cujo estado é mostrado ao final; sem valor usa a mais recente.
        #[arg(long)]
        session: Option<Uuid>,
    },

    /// Mostra o estado da sessão, contribuições por modelo e jobs.
    Status {
        #[arg(long)]
        session: Option<Uuid>,
    },

    /// Lista os estágios e passos das receitas carregadas.
    Recipes,

    /// Marca um job como falho (ação de operador).
    FailJob {
        job_id: Uuid,

        #[arg(long, default_value = "forced by operator")]
        reason: String,
    },
}
