use thiserror::Error;

use crate::dfu::DfuError;
use crate::image::ParseError;
use crate::layout::LayoutError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Dfu(#[from] DfuError),

    #[error(transparent)]
    Layout(#[from] LayoutError),
}
