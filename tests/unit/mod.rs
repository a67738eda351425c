//! Unit test modules.

mod decoder_test;
mod gatt_parser_test;
mod wire_format_test;
