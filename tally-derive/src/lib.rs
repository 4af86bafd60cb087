//! Derive macros for tally element types.
//!
//! - `FixedLayout` lays a struct out field by field, in declaration order,
//!   with no padding. The encoded size is the sum of the field sizes.
//! - `Reduce` folds a struct field by field. A field is combined with one of
//!   the builtin operators when annotated with `#[reduce(sum)]`,
//!   `#[reduce(max)]`, `#[reduce(min)]` or `#[reduce(bit_or)]`, left as is with
//!   `#[reduce(skip)]`, and reduced with its own `Reduce` implementation
//!   otherwise.
//!
//! Both derives accept named, tuple and unit structs. Generated code refers to
//! the `tally` crate by its absolute path.
extern crate proc_macro;

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{
    parse_macro_input, spanned::Spanned, Attribute, Data, DeriveInput, Error, Fields, Index,
    Member, Result, Type,
};

struct Field<'a> {
    member: Member,
    ty: &'a Type,
    attrs: &'a [Attribute],
}

/// Collect the fields of a struct, in declaration order.
fn struct_fields(input: &DeriveInput) -> Result<Vec<Field<'_>>> {
    let Data::Struct(data) = &input.data else {
        return Err(Error::new(
            input.ident.span(),
            "tally derives are only supported on structs",
        ));
    };

    let fields = match &data.fields {
        Fields::Named(fields) => fields
            .named
            .iter()
            .filter_map(|field| {
                field.ident.clone().map(|ident| Field {
                    member: Member::Named(ident),
                    ty: &field.ty,
                    attrs: &field.attrs,
                })
            })
            .collect(),
        Fields::Unnamed(fields) => fields
            .unnamed
            .iter()
            .enumerate()
            .map(|(i, field)| Field {
                member: Member::Unnamed(Index {
                    index: i as u32,
                    span: field.span(),
                }),
                ty: &field.ty,
                attrs: &field.attrs,
            })
            .collect(),
        Fields::Unit => Vec::new(),
    };

    Ok(fields)
}

#[proc_macro_derive(FixedLayout)]
pub fn fixed_layout_derive(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand_fixed_layout(&input)
        .unwrap_or_else(Error::into_compile_error)
        .into()
}

fn expand_fixed_layout(input: &DeriveInput) -> Result<TokenStream2> {
    let fields = struct_fields(input)?;
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    let members = fields.iter().map(|f| &f.member).collect::<Vec<_>>();
    let tys = fields.iter().map(|f| f.ty).collect::<Vec<_>>();

    Ok(quote! {
        impl #impl_generics ::tally::wire::FixedLayout for #name #ty_generics #where_clause {
            const SIZE: usize = 0 #(+ <#tys as ::tally::wire::FixedLayout>::SIZE)*;

            #[allow(unused_assignments, unused_mut, unused_variables)]
            fn read_from(bytes: &[u8]) -> Self {
                let mut offset = 0usize;
                Self {
                    #(#members: {
                        let end = offset + <#tys as ::tally::wire::FixedLayout>::SIZE;
                        let value = <#tys as ::tally::wire::FixedLayout>::read_from(&bytes[offset..end]);
                        offset = end;
                        value
                    },)*
                }
            }

            #[allow(unused_assignments, unused_mut, unused_variables)]
            fn write_to(&self, bytes: &mut [u8]) {
                let mut offset = 0usize;
                #({
                    let end = offset + <#tys as ::tally::wire::FixedLayout>::SIZE;
                    ::tally::wire::FixedLayout::write_to(&self.#members, &mut bytes[offset..end]);
                    offset = end;
                })*
            }
        }
    })
}

/// How a single field is folded.
enum FieldRule {
    Operator(&'static str),
    Skip,
    Nested,
}

/// Parse the `reduce` attributes of a field.
fn field_rule(attrs: &[Attribute]) -> Result<FieldRule> {
    let mut rule = None;
    let mut errors: Option<Error> = None;

    for attr in attrs.iter().filter(|attr| attr.path().is_ident("reduce")) {
        if let Err(err) = attr.parse_nested_meta(|meta| {
            let parsed = if meta.path.is_ident("sum") {
                FieldRule::Operator("Sum")
            } else if meta.path.is_ident("max") {
                FieldRule::Operator("Max")
            } else if meta.path.is_ident("min") {
                FieldRule::Operator("Min")
            } else if meta.path.is_ident("bit_or") {
                FieldRule::Operator("BitOr")
            } else if meta.path.is_ident("skip") {
                FieldRule::Skip
            } else {
                return Err(meta.error("unsupported reduce attribute"));
            };

            if rule.is_some() {
                return Err(meta.error("duplicate reduce attribute"));
            }
            rule = Some(parsed);
            Ok(())
        }) {
            match &mut errors {
                None => errors = Some(err),
                Some(errors) => errors.combine(err),
            }
        }
    }

    match errors {
        None => Ok(rule.unwrap_or(FieldRule::Nested)),
        Some(errors) => Err(errors),
    }
}

#[proc_macro_derive(Reduce, attributes(reduce))]
pub fn reduce_derive(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand_reduce(&input)
        .unwrap_or_else(Error::into_compile_error)
        .into()
}

fn expand_reduce(input: &DeriveInput) -> Result<TokenStream2> {
    let fields = struct_fields(input)?;
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let mut folds = Vec::with_capacity(fields.len());
    for Field { member, ty, attrs } in &fields {
        match field_rule(attrs)? {
            FieldRule::Operator(op) => {
                let op = syn::Ident::new(op, member.span());
                folds.push(quote! {
                    <::tally::operation::#op as ::tally::operation::Operator<#ty>>::combine(
                        &mut self.#member,
                        &src.#member,
                    );
                });
            }
            FieldRule::Nested => folds.push(quote! {
                ::tally::operation::Reduce::reduce(&mut self.#member, &src.#member);
            }),
            FieldRule::Skip => {}
        }
    }

    Ok(quote! {
        impl #impl_generics ::tally::operation::Reduce for #name #ty_generics #where_clause {
            #[allow(unused_variables)]
            fn reduce(&mut self, src: &Self) {
                #(#folds)*
            }
        }
    })
}
