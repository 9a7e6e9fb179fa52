pub mod trace_frame;
pub mod trace_reader;
pub mod trace_stream;
pub mod trace_writer;
