//! Watchdog attributes for tests that talk to actors and sockets.
//!
//! A test that waits on a channel which never fires would otherwise hang the
//! whole suite; these attributes run the body on its own thread and fail the
//! test once the deadline passes.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Async test on a current-thread Tokio runtime with time and io enabled.
/// Replaces `#[tokio::test]`; accepts an optional timeout in seconds.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let function = parse_macro_input!(item as ItemFn);
    expand(attr.into(), function, Flavor::Tokio)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

/// Synchronous test with an optional timeout in seconds. Replaces `#[test]`.
#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let function = parse_macro_input!(item as ItemFn);
    expand(attr.into(), function, Flavor::Sync)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

#[derive(Clone, Copy)]
enum Flavor {
    Sync,
    Tokio,
}

fn expand(attr: TokenStream2, function: ItemFn, flavor: Flavor) -> syn::Result<TokenStream2> {
    let timeout_secs = parse_timeout_secs(attr)?;
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = function;

    match (flavor, sig.asyncness.is_some()) {
        (Flavor::Tokio, false) => {
            return Err(syn::Error::new_spanned(
                &sig.ident,
                "tokio_timeout_test can only be applied to async functions",
            ));
        }
        (Flavor::Sync, true) => {
            return Err(syn::Error::new_spanned(
                &sig.ident,
                "timeout expects a synchronous test function; use tokio_timeout_test",
            ));
        }
        _ => {}
    }
    sig.asyncness = None;

    let attrs = strip_test_attributes(attrs);
    let test_name = sig.ident.to_string();
    let body = match flavor {
        Flavor::Sync => quote! { (|| #block)() },
        Flavor::Tokio => quote! {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build Tokio runtime")
                .block_on(async move #block)
        },
    };

    Ok(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let deadline = std::time::Duration::from_secs(#timeout_secs);
            let (report, outcome) = std::sync::mpsc::channel();
            std::thread::Builder::new()
                .name(#test_name.to_string())
                .spawn(move || {
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| #body));
                    let _ = report.send(result);
                })
                .expect("failed to spawn test thread");
            match outcome.recv_timeout(deadline) {
                Ok(Ok(value)) => value,
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("{} timed out after {:?}", #test_name, deadline)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("{} exited before reporting a result", #test_name)
                }
            }
        }
    })
}

fn parse_timeout_secs(attr: TokenStream2) -> syn::Result<u64> {
    if attr.is_empty() {
        return Ok(DEFAULT_TIMEOUT_SECS);
    }
    let literal: LitInt = syn::parse2(attr)?;
    let secs: u64 = literal.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(
            literal,
            "timeout must be greater than zero",
        ));
    }
    Ok(secs)
}

/// Drop `#[test]` and `#[tokio::test]` so the generated `#[test]` is the only one.
fn strip_test_attributes(attrs: Vec<Attribute>) -> Vec<Attribute> {
    attrs
        .into_iter()
        .filter(|attr| {
            let segments: Vec<String> = attr
                .path()
                .segments
                .iter()
                .map(|segment| segment.ident.to_string())
                .collect();
            !matches!(
                segments.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
                ["test"] | ["tokio", "test"]
            )
        })
        .collect()
}
