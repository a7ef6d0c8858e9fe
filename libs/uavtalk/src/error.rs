use miette::Diagnostic;
use thiserror::Error;

#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    #[error("payload of {len} bytes exceeds the {max} byte frame limit")]
    #[diagnostic(
        code(uavtalk::payload_too_large),
        help("objects larger than one frame cannot be sent over UAVTalk")
    )]
    PayloadTooLarge { len: usize, max: usize },
}
