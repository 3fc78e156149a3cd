pub mod archive;
pub mod arcvec;
pub mod backup_config;
pub mod chunker;
pub mod encrypt;
pub mod file_ext;
pub mod finish;
pub mod pipeline;
pub mod progress;
pub mod redacted;
pub mod result_error;
pub mod retention;
pub mod source;
pub mod tar;
pub mod upload;
pub mod validate;

macro_rules! function_path {
    () => {
        concat!(module_path!(), "::", function_name!(), " ", file!(), ":", line!())
    };
}

pub(crate) use function_path;
