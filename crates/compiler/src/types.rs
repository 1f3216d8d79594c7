//! The Etch type system
//!
//! Types are resolved structurally except for objects, enums and distinct
//! types, which are nominal. `Ref(Void)` is the canonical nil type and is
//! assignable to any ref or weak. Unions are kept deduplicated.

use etch_core::ValueTag;

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectField {
    pub name: String,
    pub ty: Type,
    /// True when the declaration supplied a default initializer
    pub has_default: bool,
    pub exported: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnumMember {
    pub name: String,
    pub int_val: i64,
    pub str_val: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Type {
    Void,
    Bool,
    Char,
    Int,
    Float,
    Str,
    Array(Box<Type>),
    Tuple(Vec<Type>),
    Option(Box<Type>),
    Result(Box<Type>),
    Ref(Box<Type>),
    Weak(Box<Type>),
    Coroutine(Box<Type>),
    Channel(Box<Type>),
    Function { params: Vec<Type>, ret: Box<Type> },
    Object { name: String, fields: Vec<ObjectField> },
    Enum { name: String, members: Vec<EnumMember> },
    Union(Vec<Type>),
    /// User-defined name not yet resolved through the type environment
    Named(String),
    /// Type parameter of a generic function; carries no runtime identity
    Generic(String),
    TypeDesc,
    Distinct { name: String, base: Box<Type> },
}

impl Type {
    /// The canonical nil type
    pub fn nil() -> Type {
        Type::Ref(Box::new(Type::Void))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Type::Ref(inner) if **inner == Type::Void)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Type::Int | Type::Float)
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, Type::Ref(_) | Type::Weak(_))
    }

    /// Build a union, flattening nested unions and deduplicating variants.
    /// A single surviving variant collapses to that variant.
    pub fn union_of(variants: Vec<Type>) -> Type {
        let mut flat: Vec<Type> = Vec::new();
        for v in variants {
            match v {
                Type::Union(inner) => {
                    for t in inner {
                        if !flat.contains(&t) {
                            flat.push(t);
                        }
                    }
                }
                t => {
                    if !flat.contains(&t) {
                        flat.push(t);
                    }
                }
            }
        }
        if flat.len() == 1 {
            flat.pop().unwrap_or(Type::Void)
        } else {
            Type::Union(flat)
        }
    }

    /// Can a value of `src` be assigned to a location of type `self`
    /// without an explicit cast?
    pub fn accepts(&self, src: &Type) -> bool {
        if self == src {
            return true;
        }
        match (self, src) {
            // nil flows into any ref or weak
            (Type::Ref(_), s) if s == &Type::nil() => true,
            (Type::Weak(_), s) if s == &Type::nil() => true,
            // union membership (including object -> union containing it)
            (Type::Union(variants), s) => variants.iter().any(|v| v.accepts(s)),
            // covariant wrappers
            (Type::Array(a), Type::Array(b)) => a.accepts(b),
            (Type::Option(a), Type::Option(b)) => a.accepts(b),
            (Type::Result(a), Type::Result(b)) => a.accepts(b),
            (Type::Coroutine(a), Type::Coroutine(b)) => a.accepts(b),
            (Type::Channel(a), Type::Channel(b)) => a.accepts(b),
            (Type::Ref(a), Type::Ref(b)) => a.accepts(b),
            (Type::Weak(a), Type::Weak(b)) => a.accepts(b),
            // A strong ref demotes to a weak implicitly (NewWeak)
            (Type::Weak(a), Type::Ref(b)) => a.accepts(b),
            (Type::Tuple(a), Type::Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.accepts(y))
            }
            // a generic slot accepts anything; binding happens in the analyzer
            (Type::Generic(_), _) => true,
            _ => false,
        }
    }

    /// Whether a value of this type participates in reference counting
    /// (drives IncRef/DecRef emission)
    pub fn is_ref_counted(&self) -> bool {
        match self {
            Type::Ref(inner) => **inner != Type::Void,
            Type::Coroutine(_) => true,
            Type::Array(elem) => elem.is_ref_counted(),
            Type::Tuple(elems) => elems.iter().any(|t| t.is_ref_counted()),
            _ => false,
        }
    }

    /// Scalar tag for FFI marshaling and function records
    pub fn value_tag(&self) -> ValueTag {
        match self {
            Type::Void => ValueTag::Void,
            Type::Bool => ValueTag::Bool,
            Type::Char => ValueTag::Char,
            Type::Int => ValueTag::Int,
            Type::Float => ValueTag::Float,
            Type::Str => ValueTag::Str,
            Type::Distinct { base, .. } => base.value_tag(),
            Type::Enum { .. } => ValueTag::Int,
            _ => ValueTag::Object,
        }
    }
}

impl std::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Type::Void => write!(f, "void"),
            Type::Bool => write!(f, "bool"),
            Type::Char => write!(f, "char"),
            Type::Int => write!(f, "int"),
            Type::Float => write!(f, "float"),
            Type::Str => write!(f, "string"),
            Type::Array(t) => write!(f, "array[{}]", t),
            Type::Tuple(ts) => {
                write!(f, "(")?;
                for (i, t) in ts.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", t)?;
                }
                write!(f, ")")
            }
            Type::Option(t) => write!(f, "option[{}]", t),
            Type::Result(t) => write!(f, "result[{}]", t),
            Type::Ref(t) if **t == Type::Void => write!(f, "nil"),
            Type::Ref(t) => write!(f, "ref {}", t),
            Type::Weak(t) => write!(f, "weak {}", t),
            Type::Coroutine(t) => write!(f, "coroutine[{}]", t),
            Type::Channel(t) => write!(f, "channel[{}]", t),
            Type::Function { params, ret } => {
                write!(f, "fn(")?;
                for (i, p) in params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", p)?;
                }
                write!(f, ") -> {}", ret)
            }
            Type::Object { name, .. } => write!(f, "{}", name),
            Type::Enum { name, .. } => write!(f, "{}", name),
            Type::Union(variants) => {
                for (i, v) in variants.iter().enumerate() {
                    if i > 0 {
                        write!(f, " | ")?;
                    }
                    write!(f, "{}", v)?;
                }
                Ok(())
            }
            Type::Named(name) => write!(f, "{}", name),
            Type::Generic(name) => write!(f, "{}", name),
            Type::TypeDesc => write!(f, "typedesc"),
            Type::Distinct { name, .. } => write!(f, "{}", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_union_dedup_and_flatten() {
        let u = Type::union_of(vec![
            Type::Int,
            Type::Union(vec![Type::Int, Type::Str]),
            Type::Str,
        ]);
        assert_eq!(u, Type::Union(vec![Type::Int, Type::Str]));
    }

    #[test]
    fn test_union_of_one_collapses() {
        assert_eq!(Type::union_of(vec![Type::Int, Type::Int]), Type::Int);
    }

    #[test]
    fn test_nil_assignable_to_refs() {
        let r = Type::Ref(Box::new(Type::Int));
        let w = Type::Weak(Box::new(Type::Int));
        assert!(r.accepts(&Type::nil()));
        assert!(w.accepts(&Type::nil()));
        assert!(!Type::Int.accepts(&Type::nil()));
    }

    #[test]
    fn test_union_accepts_member() {
        let u = Type::Union(vec![Type::Int, Type::Str]);
        assert!(u.accepts(&Type::Int));
        assert!(u.accepts(&Type::Str));
        assert!(!u.accepts(&Type::Float));
    }

    #[test]
    fn test_distinct_is_not_base() {
        let id = Type::Distinct {
            name: "Id".into(),
            base: Box::new(Type::Int),
        };
        assert!(!id.accepts(&Type::Int));
        assert!(!Type::Int.accepts(&id));
        assert_eq!(id.value_tag(), ValueTag::Int);
    }

    #[test]
    fn test_ref_counted() {
        assert!(Type::Ref(Box::new(Type::Int)).is_ref_counted());
        assert!(!Type::nil().is_ref_counted());
        assert!(Type::Array(Box::new(Type::Ref(Box::new(Type::Int)))).is_ref_counted());
        assert!(!Type::Array(Box::new(Type::Int)).is_ref_counted());
    }

    #[test]
    fn test_display() {
        let t = Type::Function {
            params: vec![Type::Int, Type::Str],
            ret: Box::new(Type::Option(Box::new(Type::Int))),
        };
        assert_eq!(t.to_string(), "fn(int, string) -> option[int]");
    }
}
