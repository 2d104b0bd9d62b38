//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
//! Procedural macros for pulse-warden
//!
//! `#[checkpoint]` turns a function into one that gives up as soon as its
//! work has been declared a zombie, by sprinkling
//! `::pulse_warden::kill_runaway()?` through its body.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{
    Error, Expr, ExprAsync, ExprClosure, ExprForLoop, ExprLoop, ExprWhile, ItemFn, Lit, Meta,
    MetaNameValue, Result, ReturnType, Stmt, Token, parse_macro_input, parse_quote,
    punctuated::Punctuated, visit_mut::VisitMut,
};

/// Configuration for the checkpoint macro
#[derive(Debug, Clone, PartialEq, Eq)]
struct CheckpointConfig {
    /// Check after every N-th await statement
    check_interval: u32,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self { check_interval: 1 }
    }
}

impl CheckpointConfig {
    /// Parse configuration from comma-separated meta items
    fn from_meta_list(meta_list: &Punctuated<Meta, Token![,]>) -> Result<Self> {
        let mut config = Self::default();

        for meta in meta_list {
            match meta {
                Meta::NameValue(MetaNameValue { path, value, .. }) if path.is_ident("check_interval") => {
                    let Expr::Lit(expr_lit) = value else {
                        return Err(Error::new_spanned(value, "Check interval value must be an integer literal"));
                    };
                    let Lit::Int(int_lit) = &expr_lit.lit else {
                        return Err(Error::new_spanned(expr_lit, "Check interval must be an integer"));
                    };
                    let interval = int_lit.base10_parse::<u32>()?;
                    if interval == 0 {
                        return Err(Error::new_spanned(int_lit, "Check interval must be greater than 0"));
                    }
                    config.check_interval = interval;
                }
                _ => {
                    return Err(Error::new_spanned(meta, "Invalid argument. Supported: check_interval"));
                }
            }
        }

        Ok(config)
    }
}

/// Visitor that injects checkpoints into loop bodies and after awaits
struct CheckpointInjector {
    config: CheckpointConfig,
    await_count: u32,
}

impl CheckpointInjector {
    fn new(config: CheckpointConfig) -> Self {
        Self {
            config,
            await_count: 0,
        }
    }

    fn checkpoint() -> Stmt {
        parse_quote! {
            ::pulse_warden::kill_runaway()?;
        }
    }

    fn prepend(block: &mut syn::Block) {
        block.stmts.insert(0, Self::checkpoint());
    }
}

impl VisitMut for CheckpointInjector {
    fn visit_block_mut(&mut self, block: &mut syn::Block) {
        for stmt in &mut block.stmts {
            self.visit_stmt_mut(stmt);
        }

        let mut new_stmts = Vec::with_capacity(block.stmts.len());
        for stmt in block.stmts.drain(..) {
            // Tail expressions carry the block's value and must stay last
            let terminated = matches!(stmt, Stmt::Local(_) | Stmt::Expr(_, Some(_)));
            let awaits = stmt_contains_await(&stmt);
            new_stmts.push(stmt);

            if terminated && awaits {
                self.await_count += 1;
                if self.await_count % self.config.check_interval == 0 {
                    new_stmts.push(Self::checkpoint());
                }
            }
        }
        block.stmts = new_stmts;
    }

    fn visit_expr_for_loop_mut(&mut self, node: &mut ExprForLoop) {
        syn::visit_mut::visit_expr_for_loop_mut(self, node);
        Self::prepend(&mut node.body);
    }

    fn visit_expr_while_mut(&mut self, node: &mut ExprWhile) {
        syn::visit_mut::visit_expr_while_mut(self, node);
        Self::prepend(&mut node.body);
    }

    fn visit_expr_loop_mut(&mut self, node: &mut ExprLoop) {
        syn::visit_mut::visit_expr_loop_mut(self, node);
        Self::prepend(&mut node.body);
    }

    // `?` inside these would target a different return type
    fn visit_expr_closure_mut(&mut self, _node: &mut ExprClosure) {}

    fn visit_expr_async_mut(&mut self, _node: &mut ExprAsync) {}

    fn visit_item_fn_mut(&mut self, _node: &mut ItemFn) {}
}

fn stmt_contains_await(stmt: &Stmt) -> bool {
    match stmt {
        Stmt::Expr(expr, _) => expr_contains_await(expr),
        Stmt::Local(local) => local.init.as_ref().is_some_and(|init| expr_contains_await(&init.expr)),
        _ => false,
    }
}

fn expr_contains_await(expr: &Expr) -> bool {
    match expr {
        Expr::Await(_) => true,
        Expr::Try(expr) => expr_contains_await(&expr.expr),
        Expr::Paren(expr) => expr_contains_await(&expr.expr),
        Expr::Assign(assign) => expr_contains_await(&assign.right),
        Expr::Binary(binary) => expr_contains_await(&binary.left) || expr_contains_await(&binary.right),
        Expr::Call(call) => expr_contains_await(&call.func) || call.args.iter().any(expr_contains_await),
        Expr::MethodCall(method) => {
            expr_contains_await(&method.receiver) || method.args.iter().any(expr_contains_await)
        }
        Expr::Field(field) => expr_contains_await(&field.base),
        _ => false,
    }
}

/// Injects zombie checkpoints into a function
///
/// The function must return a `Result` whose error type can be built from
/// `pulse_warden::ZombieAbort`. A checkpoint (`::pulse_warden::kill_runaway()?`)
/// is placed at function entry, at the top of every loop body and, in async
/// functions, after await statements.
///
/// Closures, async blocks and nested functions are left alone.
///
/// # Arguments
///
/// * `check_interval` - Check after every N-th await statement (default: 1)
///
/// # Examples
///
/// ```rust,ignore
/// #[checkpoint]
/// fn crunch(rows: &[Row]) -> Result<Summary, ZombieAbort> {
///     let mut summary = Summary::default();
///     for row in rows {
///         // checkpoint injected here
///         summary.add(row);
///     }
///     Ok(summary)
/// }
///
/// #[checkpoint(check_interval = 4)]
/// async fn pump(source: &mut Source) -> Result<(), AppError> {
///     loop {
///         let batch = source.next().await;
///         // checkpoint injected after every 4th await statement
///         store(batch).await?;
///     }
/// }
/// ```
#[proc_macro_attribute]
pub fn checkpoint(args: TokenStream, input: TokenStream) -> TokenStream {
    let args = parse_macro_input!(args with Punctuated::<Meta, Token![,]>::parse_terminated);
    let input_fn = parse_macro_input!(input as ItemFn);

    match expand_checkpoint(args, input_fn) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand_checkpoint(args: Punctuated<Meta, Token![,]>, mut input_fn: ItemFn) -> Result<TokenStream2> {
    if let ReturnType::Default = input_fn.sig.output {
        return Err(Error::new_spanned(
            input_fn.sig.fn_token,
            "#[checkpoint] functions must return a Result",
        ));
    }

    let config = CheckpointConfig::from_meta_list(&args)?;
    let mut injector = CheckpointInjector::new(config);

    injector.visit_block_mut(&mut input_fn.block);
    CheckpointInjector::prepend(&mut input_fn.block);

    Ok(quote! { #input_fn })
}
