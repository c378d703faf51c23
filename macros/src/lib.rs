//! Procedural macros for lora-1ch-gateway tests.
//!
//! Provides the `#[esp32_test]` attribute used by the in-module test suites.
//! Tests marked with it exercise only host-portable code (register maps, the
//! state machine against the simulated transceiver, the wire codec), so the
//! same functions run under `cargo test` on the host and in the on-target
//! test image.

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, ItemFn};

/// Mark a function as a portable test.
///
/// On the host this expands to a plain `#[test]`. The function may return
/// `()` or a `Result<(), E>`, exactly like a standard test.
///
/// # Example
///
/// ```ignore
/// use lora_1ch_gateway_macros::esp32_test;
///
/// #[esp32_test]
/// fn frf_rounds_to_nearest_step() {
///     assert_eq!(frf_from_hz(868_100_000), 0xD9_06_66);
/// }
/// ```
#[proc_macro_attribute]
pub fn esp32_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    if !attr.is_empty() {
        let attr = proc_macro2::TokenStream::from(attr);
        return syn::Error::new_spanned(attr, "esp32_test takes no arguments")
            .to_compile_error()
            .into();
    }

    let input_fn = parse_macro_input!(item as ItemFn);

    if !input_fn.sig.inputs.is_empty() {
        return syn::Error::new_spanned(&input_fn.sig.inputs, "esp32_test functions take no arguments")
            .to_compile_error()
            .into();
    }

    let fn_attrs = &input_fn.attrs;
    let fn_vis = &input_fn.vis;
    let fn_sig = &input_fn.sig;
    let fn_block = &input_fn.block;

    let expanded = quote! {
        #[test]
        #(#fn_attrs)*
        #fn_vis #fn_sig #fn_block
    };

    TokenStream::from(expanded)
}
