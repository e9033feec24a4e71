pub mod alignment;
mod error;
mod parser;
mod reader;
mod seeker;
mod writer;

pub use alignment::AlignPowerOfTwo;
pub(crate) use error::ensure;
pub use error::{BuildProblem, Error, LoadProblem, ParseProblem, ProblemLocation, ResolveProblem, Result};
pub use parser::Parser;
pub use reader::Reader;
pub use seeker::Seeker;
pub use writer::Writer;
