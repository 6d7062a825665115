//! Built-in PostgreSQL type OIDs
//!
//! Relation messages identify column types by OID. Shapes describe columns
//! by type name, so the common built-in OIDs are mapped here; anything else
//! (domains, enums, extension types) is resolved through the catalog.
//!
//! Reference: `src/include/catalog/pg_type.dat`

/// Type name of a built-in OID, `None` for user-defined types
pub fn type_name(oid: u32) -> Option<&'static str> {
    let name = match oid {
        16 => "bool",
        17 => "bytea",
        18 => "char",
        19 => "name",
        20 => "int8",
        21 => "int2",
        23 => "int4",
        25 => "text",
        26 => "oid",
        28 => "xid",
        114 => "json",
        142 => "xml",
        600 => "point",
        601 => "lseg",
        602 => "path",
        603 => "box",
        604 => "polygon",
        628 => "line",
        650 => "cidr",
        700 => "float4",
        701 => "float8",
        718 => "circle",
        774 => "macaddr8",
        790 => "money",
        829 => "macaddr",
        869 => "inet",
        1042 => "bpchar",
        1043 => "varchar",
        1082 => "date",
        1083 => "time",
        1114 => "timestamp",
        1184 => "timestamptz",
        1186 => "interval",
        1266 => "timetz",
        1560 => "bit",
        1562 => "varbit",
        1700 => "numeric",
        2950 => "uuid",
        3614 => "tsvector",
        3802 => "jsonb",
        // arrays
        1000 => "_bool",
        1001 => "_bytea",
        1005 => "_int2",
        1007 => "_int4",
        1009 => "_text",
        1014 => "_bpchar",
        1015 => "_varchar",
        1016 => "_int8",
        1021 => "_float4",
        1022 => "_float8",
        1115 => "_timestamp",
        1182 => "_date",
        1185 => "_timestamptz",
        1231 => "_numeric",
        2951 => "_uuid",
        199 => "_json",
        3807 => "_jsonb",
        _ => return None,
    };
    Some(name)
}

/// Element type and dimensions of a type name: `_int4` is `int4` with one
/// dimension
pub fn element_type(type_name: &str) -> (&str, u32) {
    match type_name.strip_prefix('_') {
        Some(element) => (element, 1),
        None => (type_name, 0),
    }
}
