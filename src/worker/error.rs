//! Tipos de erro da fila de trabalho do worker.
//!
//! Define [`QueueError`] com variantes para autenticação, rejeições da API,
//! falhas de rede e erros do armazenamento local. Usa `thiserror` para
//! derivar `Display` e `Error` a partir dos atributos `#[error(...)]`.

use thiserror::Error;

use crate::error::TransitionError;

/// Erros que podem ocorrer ao falar com a fila de itens pagos.
///
/// Rejeições esperadas (item já reivindicado, item fora de `processing`)
/// não são erros: a fila as reporta como `None` ou `false`.
#[derive(Debug, Error)]
pub enum QueueError {
    /// O broker recusou o token do worker (HTTP 401).
    #[error("broker rejected the worker token")]
    Unauthorized,

    /// Qualquer outra resposta inesperada do broker.
    /// Contém o código de status HTTP e o corpo da resposta.
    #[error("broker error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// Falha de rede subjacente (DNS, conexão recusada, timeout).
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Falha do armazenamento no modo local.
    #[error("local queue error: {0}")]
    Local(#[from] TransitionError),
}

impl QueueError {
    /// Falhas que podem sumir numa nova tentativa: rede, erros 5xx e o banco local.
    pub fn is_transient(&self) -> bool {
        match self {
            QueueError::Network(_) | QueueError::Local(TransitionError::Store(_)) => true,
            QueueError::Api { status, .. } => *status >= 500,
            QueueError::Unauthorized | QueueError::Local(_) => false,
        }
    }
}
