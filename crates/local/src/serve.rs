use std::io::{self, BufReader, BufWriter, Read, Write};

use stellwerk_core::Registry;
use tracing::debug;

use crate::frame::{read_frame, write_frame, FrameError, ProcRequest, ProcResponse};

/// Answer task frames from `reader` on `writer` until the input ends.
///
/// Each request is independent; nothing is kept between tasks.
pub fn serve<R: Read, W: Write>(registry: &Registry, reader: R, writer: W) -> Result<u64, FrameError> {
    let mut reader = BufReader::new(reader);
    let mut writer = BufWriter::new(writer);
    let mut served = 0u64;

    while let Some(req) = read_frame::<_, ProcRequest>(&mut reader)? {
        debug!(callable = %req.callable, "serving task");
        let response = match registry.call(&req.callable, &req.args) {
            Ok(v) => ProcResponse::Ok(v),
            Err(e) => ProcResponse::Err(e),
        };
        write_frame(&mut writer, &response)?;
        served += 1;
    }
    Ok(served)
}

/// Serve over the process's stdin and stdout; the entry point of a process
/// pool child. Logging must go to stderr since stdout carries frames.
pub fn serve_stdio(registry: &Registry) -> Result<u64, FrameError> {
    serve(registry, io::stdin().lock(), io::stdout().lock())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use stellwerk_core::{CallError, Value};

    #[test]
    fn answers_each_request_in_order() {
        let mut input = Vec::new();
        write_frame(&mut input, &ProcRequest { callable: "add".into(), args: vec![Value::Int(2), Value::Int(3)] }).unwrap();
        write_frame(&mut input, &ProcRequest { callable: "nope".into(), args: vec![] }).unwrap();

        let mut output = Vec::new();
        let served = serve(&Registry::builtin(), Cursor::new(input), &mut output).unwrap();
        assert_eq!(served, 2);

        let mut cursor = Cursor::new(output);
        let first: ProcResponse = read_frame(&mut cursor).unwrap().unwrap();
        let second: ProcResponse = read_frame(&mut cursor).unwrap().unwrap();
        assert_eq!(first, ProcResponse::Ok(Value::Int(5)));
        assert_eq!(second, ProcResponse::Err(CallError::UnknownCallable("nope".into())));
    }
}
